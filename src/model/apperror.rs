use std::fmt;

/**
 * Represents the type of error that can occur within the application.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    /**
     * Missing, empty or malformed request fields.
     */
    InvalidData,
    /**
     * Image payload is not a data url with an image media type.
     */
    InvalidImageType,
    /**
     * A reading already exists for the customer and type in the same month.
     */
    DoubleReport,
    /**
     * The oracle answered but no number could be read from the answer.
     */
    ExtractionFailed,
    /**
     * The oracle call itself failed.
     */
    OracleError,
    MeasureNotFound,
    ConfirmationDuplicate,
    /**
     * Measure type filter is neither WATER nor GAS.
     */
    InvalidType,
    MeasuresNotFound,
    DatabaseError,
    Initialization,
    Application,
}

/**
 * Represents an error that occurs within the application.
 */
#[derive(Debug, Clone)]
pub struct ApplicationError {
    /**
     * Error type.
     */
    pub error_type: ErrorType,
    /**
     * Error message describing problem.
     */
    pub message: String,
}

impl ApplicationError {
    /**
     * Creates a new ApplicationError.
     *
     * #Arguments
     * `error_type`: The type of error.
     * `message`: A description of the error.
     */
    pub fn new(error_type: ErrorType, message: String) -> Self {
        ApplicationError { error_type, message }
    }
}

impl fmt::Display for ApplicationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ApplicationError {}
