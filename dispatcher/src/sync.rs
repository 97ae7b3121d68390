pub mod cancel;
pub mod signals;

pub use cancel::CancellationToken;
