use crate::http::request::HttpRequest;
use crate::http::response::{HttpError, Response};

/// Produces the response for a finished request.
///
/// One handler is shared by every loop of a server, so it must be
/// stateless or synchronize its own state. Routing lives behind this trait.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: &HttpRequest) -> Result<Response, HttpError>;
}

impl<F> RequestHandler for F
where
    F: Fn(&HttpRequest) -> Result<Response, HttpError> + Send + Sync,
{
    fn handle(&self, request: &HttpRequest) -> Result<Response, HttpError> {
        self(request)
    }
}
