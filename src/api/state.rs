use crate::service::measure::MeasureService;

/**
* Represents the application state shared across the Actix web application.
*/
pub struct AppState {
    /**
     * The measure service handling uploads, confirmations and listings.
     */
    pub measure_service: MeasureService,
}

/**
 * Creates a new instance of `AppState`.
 *
 * # Arguments
 * `measure_service`: The measure service handling uploads, confirmations and listings.
 */
impl AppState {
    pub fn new(measure_service: MeasureService) -> Self {
        AppState { measure_service }
    }
}
