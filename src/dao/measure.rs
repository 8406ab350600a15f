use std::{borrow::Cow, str::FromStr};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{PgConnection, Pool, Postgres};
use tracing::{Instrument, instrument};
use uuid::Uuid;

use crate::model::{
    apperror::{ApplicationError, ErrorType},
    models::{Measure, MeasureType},
};

/**
 * Database response type for querying measures.
 */
pub type QueryMeasureDbResp = (Uuid, String, DateTime<Utc>, String, Decimal, String, bool);

/**
 * SQL query to retrieve the measures of a customer and type within a datetime range, both ends inclusive.
 */
const QUERY_MEASURES_IN_WINDOW: &str = "SELECT uuid, customer_code, measure_datetime, measure_type, measure_value, image_url, has_confirmed FROM measure
                                        WHERE customer_code = $1 AND measure_type = $2 AND measure_datetime BETWEEN $3 AND $4";

/**
 * SQL query to retrieve a measure by its identity.
 */
const QUERY_MEASURE_BY_UUID: &str = "SELECT uuid, customer_code, measure_datetime, measure_type, measure_value, image_url, has_confirmed FROM measure WHERE uuid = $1";

/**
 * SQL query to retrieve the measures of a customer, optionally filtered by type.
 */
const QUERY_MEASURES_BY_CUSTOMER: &str = "SELECT uuid, customer_code, measure_datetime, measure_type, measure_value, image_url, has_confirmed FROM measure
                                          WHERE customer_code = $1 AND ($2::text IS NULL OR measure_type = $2)
                                          ORDER BY measure_datetime, uuid";

/**
 * SQL query to add a new measure.
 */
const ADD_MEASURE: &str = "INSERT INTO measure (uuid, customer_code, measure_datetime, measure_type, measure_value, image_url, has_confirmed, reference_month) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)";

/**
 * SQL query to confirm a measure. Only unconfirmed measures are updated.
 */
const CONFIRM_MEASURE: &str = "UPDATE measure SET measure_value = $1, has_confirmed = TRUE WHERE uuid = $2 AND has_confirmed = FALSE";

/**
 * Storage of measures used by the workflow.
 */
#[async_trait::async_trait]
pub trait MeasureRepository: Send + Sync {
    /**
     * Finds the measures of a customer and type with a datetime in `[start, end]`.
     */
    async fn find_in_window(&self, customer_code: &str, measure_type: MeasureType, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Measure>, ApplicationError>;

    async fn find_by_uuid(&self, uuid: Uuid) -> Result<Option<Measure>, ApplicationError>;

    /**
     * Persists a new measure.
     *
     * # Arguments
     * `measure`: The measure to persist.
     * `reference_month`: First day of the calendar month the measure belongs to. Unique per customer and type.
     *
     * # Returns
     * `DoubleReport` when a measure for the same customer, type and month exists.
     */
    async fn insert(&self, measure: &Measure, reference_month: NaiveDate) -> Result<(), ApplicationError>;

    /**
     * Sets the confirmed value of an unconfirmed measure.
     *
     * # Returns
     * `true` when a measure was confirmed, `false` when no unconfirmed measure with the identity exists.
     */
    async fn confirm(&self, uuid: Uuid, confirmed_value: Decimal) -> Result<bool, ApplicationError>;

    async fn list_by_customer(&self, customer_code: &str, measure_type: Option<MeasureType>) -> Result<Vec<Measure>, ApplicationError>;
}

/**
 * Converts a database row into a `Measure`.
 */
impl TryFrom<QueryMeasureDbResp> for Measure {
    type Error = ApplicationError;

    fn try_from(row: QueryMeasureDbResp) -> Result<Self, Self::Error> {
        let (uuid, customer_code, measure_datetime, measure_type, measure_value, image_url, has_confirmed) = row;
        let measure_type = MeasureType::from_str(&measure_type).map_err(|_| ApplicationError::new(ErrorType::DatabaseError, format!("Unknown measure type {measure_type} stored for {uuid}")))?;
        Ok(Measure { uuid, customer_code, measure_datetime, measure_type, measure_value, image_url, has_confirmed })
    }
}

/**
 * `PostgreSQL` backed measure repository.
 */
pub struct PgMeasureRepository {
    /**
     * The database connection pool.
     */
    connection_pool: Pool<Postgres>,
}

impl PgMeasureRepository {
    /**
     * Creates a new instance of `PgMeasureRepository`.
     *
     * # Arguments
     * `connection_pool`: The database connection pool.
     */
    pub fn new(connection_pool: Pool<Postgres>) -> Self {
        PgMeasureRepository { connection_pool }
    }

    #[instrument(skip(self, transaction, measure), fields(uuid = %measure.uuid))]
    async fn insert_measure(&self, transaction: &mut PgConnection, measure: &Measure, reference_month: NaiveDate) -> Result<(), ApplicationError> {
        let span = tracing::Span::current();
        sqlx::query(ADD_MEASURE)
            .bind(measure.uuid)
            .bind(&measure.customer_code)
            .bind(measure.measure_datetime)
            .bind(measure.measure_type.as_str())
            .bind(measure.measure_value)
            .bind(&measure.image_url)
            .bind(measure.has_confirmed)
            .bind(reference_month)
            .execute(transaction)
            .instrument(span)
            .await
            .map_err(|err| Self::handle_database_error(err.as_database_error()))?;
        Ok(())
    }

    #[instrument(skip(self, transaction))]
    async fn confirm_measure(&self, transaction: &mut PgConnection, uuid: Uuid, confirmed_value: Decimal) -> Result<bool, ApplicationError> {
        let span = tracing::Span::current();
        let result = sqlx::query(CONFIRM_MEASURE)
            .bind(confirmed_value)
            .bind(uuid)
            .execute(transaction)
            .instrument(span)
            .await
            .map_err(|err| Self::handle_database_error(err.as_database_error()))?;
        if result.rows_affected() > 1 {
            tracing::warn!("Multiple measures attempted confirmed. Rolled back");
            return Err(ApplicationError::new(ErrorType::Application, "Multiple measures attempted confirmed. Rolled back".to_string()));
        }
        Ok(result.rows_affected() == 1)
    }

    /**
     * Handles database errors and maps them to application errors.
     *
     * # Arguments
     * `error`: The database error to handle.
     *
     * # Returns
     * An `ApplicationError` corresponding to the database error.
     */
    fn handle_database_error(error: Option<&dyn sqlx::error::DatabaseError>) -> ApplicationError {
        if let Some(db_error) = error {
            tracing::debug!("Database error: {}", db_error);
            if db_error.code() == Some(Cow::Borrowed("23505")) {
                // Unique violation on customer, type and month
                return ApplicationError::new(ErrorType::DoubleReport, "Reading for this month already exists".to_string());
            } else if db_error.code() == Some(Cow::Borrowed("23514")) {
                return ApplicationError::new(ErrorType::InvalidData, "Value not allowed".to_string());
            }
            tracing::error!("Unhandled database error: {}", db_error);
            return ApplicationError::new(ErrorType::DatabaseError, format!("Unhandled database error: {db_error}"));
        }
        ApplicationError::new(ErrorType::DatabaseError, "Failed to execute database operation".to_string())
    }

    fn to_measures(rows: Vec<QueryMeasureDbResp>) -> Result<Vec<Measure>, ApplicationError> {
        rows.into_iter().map(Measure::try_from).collect()
    }
}

#[async_trait::async_trait]
impl MeasureRepository for PgMeasureRepository {
    #[instrument(skip(self), fields(result))]
    async fn find_in_window(&self, customer_code: &str, measure_type: MeasureType, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Measure>, ApplicationError> {
        let span = tracing::Span::current();
        let results: Vec<QueryMeasureDbResp> = sqlx::query_as(QUERY_MEASURES_IN_WINDOW)
            .bind(customer_code)
            .bind(measure_type.as_str())
            .bind(start)
            .bind(end)
            .fetch_all(&self.connection_pool)
            .instrument(span)
            .await
            .map_err(|err| ApplicationError::new(ErrorType::DatabaseError, format!("Failed to execute query for measures in month: {err}")))?;
        Self::to_measures(results)
    }

    #[instrument(skip(self), fields(result))]
    async fn find_by_uuid(&self, uuid: Uuid) -> Result<Option<Measure>, ApplicationError> {
        let span = tracing::Span::current();
        let result: Option<QueryMeasureDbResp> = sqlx::query_as(QUERY_MEASURE_BY_UUID)
            .bind(uuid)
            .fetch_optional(&self.connection_pool)
            .instrument(span)
            .await
            .map_err(|err| ApplicationError::new(ErrorType::DatabaseError, format!("Failed to execute query for measure: {err}")))?;
        result.map(Measure::try_from).transpose()
    }

    async fn insert(&self, measure: &Measure, reference_month: NaiveDate) -> Result<(), ApplicationError> {
        let mut transaction = self.connection_pool.begin().await.map_err(|err| ApplicationError::new(ErrorType::DatabaseError, format!("Failed to begin transaction: {err}")))?;
        match self.insert_measure(&mut transaction, measure, reference_month).await {
            Ok(()) => transaction.commit().await.map_err(|err| ApplicationError::new(ErrorType::DatabaseError, format!("Failed to commit transaction: {err}")))?,
            Err(err) => {
                transaction.rollback().await.map_err(|err| ApplicationError::new(ErrorType::DatabaseError, format!("Failed to rollback transaction: {err}")))?;
                return Err(err);
            }
        }
        Ok(())
    }

    async fn confirm(&self, uuid: Uuid, confirmed_value: Decimal) -> Result<bool, ApplicationError> {
        let mut transaction = self.connection_pool.begin().await.map_err(|err| ApplicationError::new(ErrorType::DatabaseError, format!("Failed to begin transaction: {err}")))?;
        match self.confirm_measure(&mut transaction, uuid, confirmed_value).await {
            Ok(confirmed) => {
                transaction.commit().await.map_err(|err| ApplicationError::new(ErrorType::DatabaseError, format!("Failed to commit transaction: {err}")))?;
                Ok(confirmed)
            }
            Err(err) => {
                transaction.rollback().await.map_err(|err| ApplicationError::new(ErrorType::DatabaseError, format!("Failed to rollback transaction: {err}")))?;
                Err(err)
            }
        }
    }

    #[instrument(skip(self), fields(result))]
    async fn list_by_customer(&self, customer_code: &str, measure_type: Option<MeasureType>) -> Result<Vec<Measure>, ApplicationError> {
        let span = tracing::Span::current();
        let results: Vec<QueryMeasureDbResp> = sqlx::query_as(QUERY_MEASURES_BY_CUSTOMER)
            .bind(customer_code)
            .bind(measure_type.map(|measure_type| measure_type.as_str()))
            .fetch_all(&self.connection_pool)
            .instrument(span)
            .await
            .map_err(|err| ApplicationError::new(ErrorType::DatabaseError, format!("Failed to execute query for measures list: {err}")))?;
        Self::to_measures(results)
    }
}


#[cfg(feature = "integration-test")]
#[cfg(test)]
mod integration_test {
    use super::*;
    use chrono::TimeZone;
    use sqlx::PgPool;

    fn measure(customer_code: &str, measure_datetime: DateTime<Utc>) -> Measure {
        Measure::new(customer_code.to_string(), measure_datetime, MeasureType::Water, Decimal::new(1234, 1), "https://files/test".to_string())
    }

    fn unique_customer() -> String {
        format!("it-{}", Uuid::new_v4())
    }

    #[sqlx::test]
    async fn test_insert_then_find() {
        let repository = PgMeasureRepository::new(init_db().await);
        let customer_code = unique_customer();
        let datetime = Utc.with_ymd_and_hms(2024, 8, 15, 12, 0, 0).unwrap();
        let new_measure = measure(&customer_code, datetime);
        repository.insert(&new_measure, NaiveDate::from_ymd_opt(2024, 8, 1).unwrap()).await.unwrap();

        let found = repository.find_by_uuid(new_measure.uuid).await.unwrap();
        assert_eq!(found.map(|m| m.uuid), Some(new_measure.uuid));

        let start = Utc.with_ymd_and_hms(2024, 8, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 8, 31, 23, 59, 59).unwrap();
        let in_window = repository.find_in_window(&customer_code, MeasureType::Water, start, end).await.unwrap();
        assert_eq!(in_window.len(), 1);
        let other_type = repository.find_in_window(&customer_code, MeasureType::Gas, start, end).await.unwrap();
        assert!(other_type.is_empty());
    }

    #[sqlx::test]
    async fn test_insert_same_month_is_double_report() {
        let repository = PgMeasureRepository::new(init_db().await);
        let customer_code = unique_customer();
        let month = NaiveDate::from_ymd_opt(2024, 8, 1).unwrap();
        repository.insert(&measure(&customer_code, Utc.with_ymd_and_hms(2024, 8, 2, 0, 0, 0).unwrap()), month).await.unwrap();
        let err = repository.insert(&measure(&customer_code, Utc.with_ymd_and_hms(2024, 8, 20, 0, 0, 0).unwrap()), month).await.unwrap_err();
        assert_eq!(err.error_type, ErrorType::DoubleReport);
    }

    #[sqlx::test]
    async fn test_confirm_once() {
        let repository = PgMeasureRepository::new(init_db().await);
        let new_measure = measure(&unique_customer(), Utc.with_ymd_and_hms(2024, 8, 2, 0, 0, 0).unwrap());
        repository.insert(&new_measure, NaiveDate::from_ymd_opt(2024, 8, 1).unwrap()).await.unwrap();
        assert!(repository.confirm(new_measure.uuid, Decimal::from(130)).await.unwrap());
        assert!(!repository.confirm(new_measure.uuid, Decimal::from(140)).await.unwrap());
        let stored = repository.find_by_uuid(new_measure.uuid).await.unwrap().unwrap();
        assert_eq!(stored.measure_value, Decimal::from(130));
        assert!(stored.has_confirmed);
    }

    #[sqlx::test]
    async fn test_list_by_customer() {
        let repository = PgMeasureRepository::new(init_db().await);
        let customer_code = unique_customer();
        repository.insert(&measure(&customer_code, Utc.with_ymd_and_hms(2024, 7, 2, 0, 0, 0).unwrap()), NaiveDate::from_ymd_opt(2024, 7, 1).unwrap()).await.unwrap();
        repository.insert(&measure(&customer_code, Utc.with_ymd_and_hms(2024, 8, 2, 0, 0, 0).unwrap()), NaiveDate::from_ymd_opt(2024, 8, 1).unwrap()).await.unwrap();
        assert_eq!(repository.list_by_customer(&customer_code, None).await.unwrap().len(), 2);
        assert_eq!(repository.list_by_customer(&customer_code, Some(MeasureType::Water)).await.unwrap().len(), 2);
        assert!(repository.list_by_customer(&customer_code, Some(MeasureType::Gas)).await.unwrap().is_empty());
    }

    /**
     * Initialize the database connection pool.
     */
    async fn init_db() -> PgPool {
        dotenv::from_filename("./sqlx-postgresql-migration/.env-test").ok();
        let pool = PgPool::connect(dotenv::var("DATABASE_URL").unwrap().as_str()).await.unwrap();
        sqlx::migrate!("./sqlx-postgresql-migration/migrations").run(&pool).await.unwrap();
        pool
    }
}
