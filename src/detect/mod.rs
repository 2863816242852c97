mod backend;
mod backends;
mod registry;
mod result;

pub use backend::DetectionOracle;
pub use backends::{StubBackend, StubOutcome};
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use registry::{OracleRegistry, SharedOracle};
pub use result::Detection;
