pub mod enrollment;
pub mod protocol;
pub mod registry;
pub(crate) mod session;

pub use enrollment::{ConnectionBundle, DownloadGrant, EnrollmentRecord, token_digest};
pub use protocol::{Frame, FrameKind};
pub use registry::{AgentRegistry, PendingCommand, SessionHandle};
