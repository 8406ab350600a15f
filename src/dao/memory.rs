use std::sync::{
    Mutex,
    atomic::{AtomicUsize, Ordering},
};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::{
    dao::measure::MeasureRepository,
    model::{
        apperror::{ApplicationError, ErrorType},
        models::{Measure, MeasureType},
    },
};

/**
 * In-memory measure repository with the same uniqueness rules as the database schema.
 */
#[derive(Default)]
pub struct InMemoryMeasureRepository {
    rows: Mutex<Vec<(Measure, NaiveDate)>>,
    queries: AtomicUsize,
}

impl InMemoryMeasureRepository {
    pub fn with_measures(measures: Vec<(Measure, NaiveDate)>) -> Self {
        InMemoryMeasureRepository { rows: Mutex::new(measures), queries: AtomicUsize::new(0) }
    }

    pub fn measures(&self) -> Vec<Measure> {
        self.rows.lock().unwrap().iter().map(|(measure, _)| measure.clone()).collect()
    }

    /**
     * Number of calls made against the repository.
     */
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl MeasureRepository for InMemoryMeasureRepository {
    async fn find_in_window(&self, customer_code: &str, measure_type: MeasureType, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Measure>, ApplicationError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .map(|(measure, _)| measure)
            .filter(|measure| measure.customer_code == customer_code && measure.measure_type == measure_type && start <= measure.measure_datetime && measure.measure_datetime <= end)
            .cloned()
            .collect())
    }

    async fn find_by_uuid(&self, uuid: Uuid) -> Result<Option<Measure>, ApplicationError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let rows = self.rows.lock().unwrap();
        Ok(rows.iter().map(|(measure, _)| measure).find(|measure| measure.uuid == uuid).cloned())
    }

    async fn insert(&self, measure: &Measure, reference_month: NaiveDate) -> Result<(), ApplicationError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.rows.lock().unwrap();
        let exists = rows.iter().any(|(stored, month)| stored.customer_code == measure.customer_code && stored.measure_type == measure.measure_type && *month == reference_month);
        if exists {
            return Err(ApplicationError::new(ErrorType::DoubleReport, "Reading for this month already exists".to_string()));
        }
        rows.push((measure.clone(), reference_month));
        Ok(())
    }

    async fn confirm(&self, uuid: Uuid, confirmed_value: Decimal) -> Result<bool, ApplicationError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.rows.lock().unwrap();
        match rows.iter_mut().map(|(measure, _)| measure).find(|measure| measure.uuid == uuid && !measure.has_confirmed) {
            Some(measure) => {
                measure.measure_value = confirmed_value;
                measure.has_confirmed = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_by_customer(&self, customer_code: &str, measure_type: Option<MeasureType>) -> Result<Vec<Measure>, ApplicationError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .map(|(measure, _)| measure)
            .filter(|measure| measure.customer_code == customer_code && measure_type.is_none_or(|measure_type| measure.measure_type == measure_type))
            .cloned()
            .collect())
    }
}
