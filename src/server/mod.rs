// Submodules
mod arbiter;
mod handler;
mod listener;
pub mod middleware;
mod runtime;
mod sink;
mod summary;

// Public API (what main.rs and the commands import)
pub use arbiter::{Arbiter, ArbiterConfig, Conclusion, ServeSummary};
pub use handler::{gone, ExchangeContext, Handler, Outcome};
pub use listener::{Listener, TimeoutListener, TimeoutSignal};
pub use middleware::Credentials;
pub use runtime::run;
pub use sink::{BodySender, ResponseSink};
pub use summary::RequestSummary;
