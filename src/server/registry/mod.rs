pub mod auth;
pub mod challenge;
pub mod credentials;
pub mod transport;

pub use auth::{AuthError, AuthOrchestrator, AuthState};
pub use challenge::Challenge;
pub use credentials::{ConfiguredCredentials, CredentialLookup, DockerConfig};
pub use transport::{HttpTransport, OutboundRequest, Transport};
