//! Change capture: upstream feeds, normalization and dead-lettering

pub mod dead_letter;
pub mod error_handler;
pub mod feed;
pub mod normalizer;
pub mod runner;

pub use dead_letter::{open_dead_letter_sink, DeadLetter, DeadLetterBackend, DeadLetterSink};
pub use error_handler::ExponentialBackoff;
pub use feed::{ChangeFeed, ChannelChangeFeed, FeedItem, FeedSignal, SqliteChangeFeed};
pub use normalizer::{ChangeNotification, Normalizer};
pub use runner::{run_capture, CaptureStats};
