pub mod mock;
pub mod openai;
pub mod reliable;
pub mod sse;

pub use mock::{MockProvider, MockResponse, RecordingSleeper};
pub use openai::{retry_after_header, OpenAiProvider};
pub use reliable::{retry_call, ReliableProvider, Sleeper, TokioSleeper};
