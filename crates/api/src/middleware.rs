use axum::{
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use coursegen_core::{TenantId, UserId};

use crate::app::errors;
use crate::context::{ContextError, RequestContext, TENANT_HEADER, USER_HEADER};

/// Attach a [`RequestContext`] built from the gateway headers.
pub async fn context_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let ctx = match extract_context(req.headers()) {
        Ok(ctx) => ctx,
        Err(e) => return errors::json_error(StatusCode::UNAUTHORIZED, "unauthorized", e.to_string()),
    };

    req.extensions_mut().insert(ctx);
    next.run(req).await
}

pub fn extract_context(headers: &HeaderMap) -> Result<RequestContext, ContextError> {
    let tenant_id: TenantId = header(headers, TENANT_HEADER)?
        .parse()
        .map_err(|_| ContextError::Invalid(TENANT_HEADER))?;
    let user_id: UserId = header(headers, USER_HEADER)?
        .parse()
        .map_err(|_| ContextError::Invalid(USER_HEADER))?;

    Ok(RequestContext::new(tenant_id, user_id))
}

fn header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, ContextError> {
    let value = headers
        .get(name)
        .ok_or(ContextError::Missing(name))?
        .to_str()
        .map_err(|_| ContextError::Invalid(name))?
        .trim();

    if value.is_empty() {
        return Err(ContextError::Missing(name));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn both_headers_are_required() {
        let tenant = TenantId::new();
        let user = UserId::new();

        let mut headers = HeaderMap::new();
        assert_eq!(extract_context(&headers), Err(ContextError::Missing(TENANT_HEADER)));

        headers.insert(TENANT_HEADER, HeaderValue::from_str(&tenant.to_string()).unwrap());
        assert_eq!(extract_context(&headers), Err(ContextError::Missing(USER_HEADER)));

        headers.insert(USER_HEADER, HeaderValue::from_str(&user.to_string()).unwrap());
        assert_eq!(extract_context(&headers), Ok(RequestContext::new(tenant, user)));
    }

    #[test]
    fn malformed_ids_are_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(TENANT_HEADER, HeaderValue::from_static("acme"));
        headers.insert(USER_HEADER, HeaderValue::from_str(&UserId::new().to_string()).unwrap());
        assert_eq!(extract_context(&headers), Err(ContextError::Invalid(TENANT_HEADER)));
    }
}
