use std::sync::Arc;

use crate::request::GenerationRequest;
use crate::result::{GenerationResponse, ProviderError};

/// External AI content collaborator.
///
/// Implementations must be safe to call concurrently from many workers. A call
/// is never interrupted once started; cancellation is checked by callers
/// before and after it.
#[async_trait::async_trait]
pub trait ContentProvider: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &str;

    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, ProviderError>;
}

#[async_trait::async_trait]
impl<P> ContentProvider for Arc<P>
where
    P: ContentProvider + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, ProviderError> {
        (**self).generate(request).await
    }
}
