use kube::error::ErrorResponse;
use kube::Error;

const STATUS_CODE_404_NOT_FOUND: u16 = 404;
const STATUS_CODE_408_TIMEOUT: u16 = 408;
const STATUS_CODE_429_TOO_MANY_REQUESTS: u16 = 429;
const STATUS_CODE_500_INTERNAL_SERVER_ERROR: u16 = 500;
const STATUS_CODE_502_BAD_GATEWAY: u16 = 502;
const STATUS_CODE_503_SERVICE_UNAVAILABLE: u16 = 503;
const STATUS_CODE_504_GATEWAY_TIMEOUT: u16 = 504;

pub fn is_404_not_found_error(err: &Error) -> bool {
    matches!(
        err,
        Error::Api(ErrorResponse {
            code: STATUS_CODE_404_NOT_FOUND,
            ..
        })
    )
}

/// Worth retrying as is. 429 is also how the eviction API reports a PodDisruptionBudget.
pub fn is_transient_error(err: &Error) -> bool {
    match err {
        Error::Api(ErrorResponse {
            code:
                STATUS_CODE_408_TIMEOUT
                | STATUS_CODE_429_TOO_MANY_REQUESTS
                | STATUS_CODE_502_BAD_GATEWAY
                | STATUS_CODE_503_SERVICE_UNAVAILABLE
                | STATUS_CODE_504_GATEWAY_TIMEOUT,
            ..
        }) => true,

        Error::Api(ErrorResponse {
            code: STATUS_CODE_500_INTERNAL_SERVER_ERROR,
            reason,
            ..
        }) if reason == "ServerTimeout" => true,

        _ => false,
    }
}
