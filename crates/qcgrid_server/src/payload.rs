//! JSON/MsgPack body negotiation.
//!
//! Bodies are selectable per request: `application/json` (default) or
//! `application/msgpack`. Responses mirror the request's format, which is
//! what the portal clients expect.

use axum::{
    async_trait,
    body::Bytes,
    extract::{FromRequest, Request},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use qcgrid_core::proto::ErrorBody;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Json,
    MsgPack,
}

impl WireFormat {
    fn from_content_type(content_type: Option<&str>) -> Result<Self, Response> {
        match content_type {
            None => Ok(Self::Json),
            Some(value) => {
                let mime = value.split(';').next().unwrap_or("").trim();
                match mime {
                    "" | "application/json" => Ok(Self::Json),
                    "application/msgpack" | "application/x-msgpack" => Ok(Self::MsgPack),
                    other => Err(reject(
                        StatusCode::UNSUPPORTED_MEDIA_TYPE,
                        format!("unsupported content type {other}"),
                    )),
                }
            }
        }
    }
}

/// Extractor for negotiated request bodies.
pub struct Payload<T> {
    pub body: T,
    pub format: WireFormat,
}

impl<T> Payload<T> {
    /// Respond in the same format the request arrived in.
    pub fn reply<R>(&self, value: R) -> Encoded<R> {
        Encoded {
            format: self.format,
            value,
        }
    }
}

fn reject(status: StatusCode, msg: String) -> Response {
    (status, Json(ErrorBody { msg })).into_response()
}

#[async_trait]
impl<S, T> FromRequest<S> for Payload<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let format = WireFormat::from_content_type(content_type.as_deref())?;

        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| reject(StatusCode::BAD_REQUEST, format!("cannot read body: {e}")))?;

        let body = match format {
            WireFormat::Json => serde_json::from_slice(&bytes)
                .map_err(|e| reject(StatusCode::BAD_REQUEST, format!("malformed json: {e}")))?,
            WireFormat::MsgPack => rmp_serde::from_slice(&bytes)
                .map_err(|e| reject(StatusCode::BAD_REQUEST, format!("malformed msgpack: {e}")))?,
        };

        Ok(Payload { body, format })
    }
}

/// Response wrapper serialized in the negotiated format.
pub struct Encoded<T> {
    pub format: WireFormat,
    pub value: T,
}

impl<T: Serialize> IntoResponse for Encoded<T> {
    fn into_response(self) -> Response {
        match self.format {
            WireFormat::Json => Json(self.value).into_response(),
            WireFormat::MsgPack => match rmp_serde::to_vec_named(&self.value) {
                Ok(bytes) => (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "application/msgpack")],
                    bytes,
                )
                    .into_response(),
                Err(e) => reject(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("msgpack encoding failed: {e}"),
                ),
            },
        }
    }
}
