use std::sync::Arc;

use chrono::{FixedOffset, Utc};
use rust_decimal::Decimal;
use tracing::{Instrument, info, instrument};

use crate::{
    dao::measure::MeasureRepository,
    model::{
        apperror::{ApplicationError, ErrorType},
        config::MeasureConfig,
        models::{ConfirmMeasureInputType, Measure, MeasureListElementType, MeasureListInputType, MeasureListOutputType, MeasureType, UploadMeasureInputType, UploadMeasureOutputType},
    },
    oracle::{READING_PROMPT, RecognitionOracle},
    service::{
        extraction::extract_measure_value,
        window::{MonthWindow, month_window},
    },
    utils::image::image_file_name,
};

/**
 * Settings of the measure workflow.
 */
#[derive(Debug, Clone, Copy)]
pub struct MeasureSettings {
    /**
     * Offset of the clock used for calendar month boundaries.
     */
    pub utc_offset: FixedOffset,
}

impl MeasureSettings {
    /**
     * Creates the settings from configuration.
     *
     * # Returns
     * The settings or an `Initialization` error when the offset is out of range.
     */
    pub fn from_config(config: &MeasureConfig) -> Result<Self, ApplicationError> {
        let utc_offset = config
            .utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| ApplicationError::new(ErrorType::Initialization, format!("Invalid utc offset {} minutes", config.utc_offset_minutes)))?;
        Ok(MeasureSettings { utc_offset })
    }
}

/**
 * Represents the service for uploading, confirming and listing meter readings.
 */
pub struct MeasureService {
    /**
     * Storage of measures.
     */
    repository: Arc<dyn MeasureRepository>,
    /**
     * Image recognition service reading the meter value.
     */
    oracle: Arc<dyn RecognitionOracle>,
    settings: MeasureSettings,
}

impl MeasureService {
    /**
     * Creates a new instance of `MeasureService`.
     *
     * # Arguments
     * `repository`: Storage of measures.
     * `oracle`: Image recognition service.
     * `settings`: Workflow settings.
     */
    pub fn new(repository: Arc<dyn MeasureRepository>, oracle: Arc<dyn RecognitionOracle>, settings: MeasureSettings) -> Self {
        MeasureService { repository, oracle, settings }
    }

    /**
     * Offset of the service clock.
     */
    pub fn utc_offset(&self) -> FixedOffset {
        self.settings.utc_offset
    }

    /**
     * Uploads a new reading: checks for a reading in the same month, stores the image, reads the value and persists the measure.
     *
     * # Arguments
     * `input`: Validated upload input.
     *
     * # Returns
     * The identity, value and image url of the new measure, or `DoubleReport`, `OracleError`, `ExtractionFailed` or a database error.
     */
    #[instrument(skip(self, input), fields(customer_code = %input.customer_code, measure_type = %input.measure_type, measure_uuid))]
    pub async fn upload(&self, input: UploadMeasureInputType) -> Result<UploadMeasureOutputType, ApplicationError> {
        let span = tracing::Span::current();
        let window = month_window(input.measure_datetime, self.settings.utc_offset)?;
        self.check_double_report(&input.customer_code, input.measure_type, &window).instrument(span.clone()).await?;

        let upload_date = Utc::now().with_timezone(&self.settings.utc_offset).date_naive();
        let display_name = image_file_name(&input.customer_code, &input.image, upload_date);
        let image_url = self.oracle.upload_image(&input.image, &display_name).instrument(span.clone()).await?;

        let fragments = self.oracle.stream_reading(READING_PROMPT, &input.image).instrument(span.clone()).await?;
        let measure_value = extract_measure_value(fragments).instrument(span.clone()).await?;

        let measure = Measure::new(input.customer_code, input.measure_datetime, input.measure_type, measure_value, image_url);
        self.repository.insert(&measure, window.reference_month).instrument(span.clone()).await?;
        span.record("measure_uuid", tracing::field::display(measure.uuid));
        info!("Stored measure {} with value {}", measure.uuid, measure.measure_value);
        Ok(UploadMeasureOutputType::from(measure))
    }

    /**
     * Confirms the value of a measure. A measure can only be confirmed once.
     *
     * # Arguments
     * `input`: Validated confirm input.
     *
     * # Returns
     * Ok, `MeasureNotFound` or `ConfirmationDuplicate`.
     */
    #[instrument(skip(self))]
    pub async fn confirm(&self, input: ConfirmMeasureInputType) -> Result<(), ApplicationError> {
        let span = tracing::Span::current();
        let measure = self.repository.find_by_uuid(input.measure_uuid).instrument(span.clone()).await?;
        let Some(measure) = measure else {
            return Err(measure_not_found());
        };
        if measure.has_confirmed {
            return Err(confirmation_duplicate());
        }
        let confirmed = self.repository.confirm(measure.uuid, Decimal::from(input.confirmed_value)).instrument(span.clone()).await?;
        if !confirmed {
            // Changed between lookup and update
            tracing::warn!("Measure {} changed during confirmation", measure.uuid);
            return match self.repository.find_by_uuid(measure.uuid).instrument(span).await? {
                Some(_) => Err(confirmation_duplicate()),
                None => Err(measure_not_found()),
            };
        }
        info!("Confirmed measure {} with value {}", measure.uuid, input.confirmed_value);
        Ok(())
    }

    /**
     * Lists the measures of a customer, optionally filtered by type.
     *
     * # Arguments
     * `input`: Customer code and optional type filter.
     *
     * # Returns
     * The measures without their values, `InvalidType` when the filter is unknown or `MeasuresNotFound` when nothing matches.
     */
    #[instrument(skip(self))]
    pub async fn list(&self, input: MeasureListInputType) -> Result<MeasureListOutputType, ApplicationError> {
        let span = tracing::Span::current();
        let measure_type = input.measure_type.as_deref().map(MeasureType::from_filter).transpose()?;
        let measures = self.repository.list_by_customer(&input.customer_code, measure_type).instrument(span).await?;
        if measures.is_empty() {
            return Err(ApplicationError::new(ErrorType::MeasuresNotFound, "No readings found".to_string()));
        }
        let measures = measures.into_iter().map(MeasureListElementType::from).collect();
        Ok(MeasureListOutputType::new(input.customer_code, measures))
    }

    /**
     * Fails with `DoubleReport` when the customer already has a reading of the type within the window.
     */
    async fn check_double_report(&self, customer_code: &str, measure_type: MeasureType, window: &MonthWindow) -> Result<(), ApplicationError> {
        let existing = self.repository.find_in_window(customer_code, measure_type, window.start, window.end).await?;
        if !existing.is_empty() {
            tracing::debug!("Found {} readings for {} {} in {}", existing.len(), customer_code, measure_type, window.reference_month);
            return Err(ApplicationError::new(ErrorType::DoubleReport, "Reading for this month already exists".to_string()));
        }
        Ok(())
    }
}

fn measure_not_found() -> ApplicationError {
    ApplicationError::new(ErrorType::MeasureNotFound, "Reading not found".to_string())
}

fn confirmation_duplicate() -> ApplicationError {
    ApplicationError::new(ErrorType::ConfirmationDuplicate, "Reading already confirmed".to_string())
}
