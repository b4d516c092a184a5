use std::collections::HashMap;

use aws_sdk_s3::config::interceptors::{
    AfterDeserializationInterceptorContextRef, BeforeTransmitInterceptorContextRef,
};
use aws_sdk_s3::config::{ConfigBag, Intercept, RuntimeComponents};
use aws_sdk_s3::error::BoxError;
use tracing::debug;

/// Logs each S3 API request and response as it completes, including any
/// response headers the operator asked to capture.
#[derive(Debug)]
pub(crate) struct ApiLogger {
    /// log field name -> response header name
    response_headers: HashMap<String, String>,
}

impl ApiLogger {
    pub(crate) fn new(response_headers: HashMap<String, String>) -> Self {
        Self { response_headers }
    }
}

impl Intercept for ApiLogger {
    fn name(&self) -> &'static str {
        "ApiLogger"
    }

    fn read_after_serialization(
        &self,
        context: &BeforeTransmitInterceptorContextRef<'_>,
        _runtime_components: &RuntimeComponents,
        _cfg: &mut ConfigBag,
    ) -> Result<(), BoxError> {
        let request = context.request();
        debug!(
            method = %request.method(),
            uri = %request.uri(),
            "s3 api request"
        );
        Ok(())
    }

    fn read_after_deserialization(
        &self,
        context: &AfterDeserializationInterceptorContextRef<'_>,
        _runtime_components: &RuntimeComponents,
        _cfg: &mut ConfigBag,
    ) -> Result<(), BoxError> {
        let response = context.response();
        let request_id = response.headers().get("x-amz-request-id").unwrap_or("");
        debug!(
            status = response.status().as_u16(),
            request_id, "s3 api response"
        );
        for (field, header) in &self.response_headers {
            if let Some(value) = response.headers().get(header.as_str()) {
                debug!(field = %field, value = %value, "s3 api response header");
            }
        }
        Ok(())
    }
}
