mod buffer;

pub use buffer::{Buffer, Span, MSG_MAX};
