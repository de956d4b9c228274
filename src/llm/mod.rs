pub mod gateway;
pub mod gemini;
pub mod media;

pub use gemini::GeminiGateway;
