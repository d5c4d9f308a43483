//! Wire types shared by the gateway client and the session controller.
//!
//! Two families live here: the kernel messaging envelope that flows over a
//! kernel's channels socket, and the REST shapes of the gateway control plane.

pub mod content;
pub mod envelope;
pub mod kernel;

pub use content::{
    DisplayDataContent, ErrorContent, ExecuteResultContent, OutputKind, OutputPayload,
    StreamContent,
};
pub use envelope::{CodecError, Envelope, Header, KernelMessage, MessageKind};
pub use kernel::{ApiInfo, ErrorResponse, ExecutionState, Kernel, StartKernelRequest};
