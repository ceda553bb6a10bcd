#[allow(clippy::all)]
#[path = "speaker.v1.rs"]
pub mod speaker;
