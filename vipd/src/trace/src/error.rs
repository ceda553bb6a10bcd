/// Errors that end up on a failure metric implement this to provide the
/// label value.
pub trait TraceableError: std::error::Error {
    fn metric_label(&self) -> String;
}
