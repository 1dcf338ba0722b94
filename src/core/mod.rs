mod gateway;
mod metering;
mod resolver;

pub use gateway::{
    ClientInfo, ExecuteRequest, ExecuteResponse, GatewayError, PromptGateway, PromptRef,
};
pub use metering::{CallOutcome, CallRecorder, MeteringGuard};
pub use resolver::{synthesize, ProviderResolver, ResolveError, ResolvedProvider};
