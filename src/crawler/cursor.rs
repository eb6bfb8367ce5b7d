//! Pagination cursors
//!
//! A cursor looks at the request that produced a page and the page's body
//! and decides which request comes next, if any.

use crate::config::PaginationStyle;
use crate::crawler::PageRequest;
use crate::{FetchError, FetchResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{Map, Value};
use std::sync::Arc;
use url::Url;

/// Query parameter holding the encoded page parameters of page-number APIs
pub const R_PARAM: &str = "_r";

/// Query parameter receiving the continuation token of token APIs
pub const AFTER_PARAM: &str = "after";

/// Decides the next request of a stream from the current page
pub trait PageCursor: Send + Sync {
    /// Returns the next request, or `None` when pagination has ended
    fn next_request(&self, request: &PageRequest, body: &Value)
        -> FetchResult<Option<PageRequest>>;
}

/// Follows `pagination.links[rel == "next"].uri`
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkCursor;

impl PageCursor for LinkCursor {
    fn next_request(
        &self,
        request: &PageRequest,
        body: &Value,
    ) -> FetchResult<Option<PageRequest>> {
        let next = body
            .pointer("/pagination/links")
            .and_then(Value::as_array)
            .and_then(|links| {
                links
                    .iter()
                    .find(|link| link.get("rel").and_then(Value::as_str) == Some("next"))
            })
            .and_then(|link| link.get("uri"))
            .and_then(Value::as_str);

        let Some(uri) = next else {
            return Ok(None);
        };
        let url = request.url.join(uri).map_err(|e| FetchError::Malformed {
            url: request.url.to_string(),
            message: format!("next link '{}' is not a URL: {}", uri, e),
        })?;
        Ok(Some(request.with_url(url)))
    }
}

/// Increments `page` inside the `_r` parameter until `page >= pages`
///
/// An initial request without a page continues from the response's `page`,
/// so 0-based APIs go on to 1 and 1-based APIs go on to 2.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageNumberCursor;

impl PageCursor for PageNumberCursor {
    fn next_request(
        &self,
        request: &PageRequest,
        body: &Value,
    ) -> FetchResult<Option<PageRequest>> {
        let Some(pagination) = body.get("pagination").filter(|p| p.is_object()) else {
            return Ok(None);
        };
        let page = pagination.get("page").and_then(Value::as_u64).unwrap_or(0);
        let pages = pagination.get("pages").and_then(Value::as_u64).unwrap_or(0);
        if page >= pages {
            return Ok(None);
        }

        let mut params = match query_param(&request.url, R_PARAM) {
            Some(encoded) => decode_r(&encoded).map_err(|message| FetchError::Malformed {
                url: request.url.to_string(),
                message,
            })?,
            None => Map::new(),
        };
        // Without a page in the request, continue from the page the API served
        let current = params
            .get("page")
            .and_then(Value::as_u64)
            .filter(|prev| *prev > 0)
            .unwrap_or(page);
        let next_page = current + 1;
        params.insert("page".to_string(), Value::from(next_page));

        let url = with_query_param(&request.url, R_PARAM, &encode_r(&params));
        Ok(Some(request.with_url(url)))
    }
}

/// Copies a non-empty `pagination.cursor` into the `after` parameter
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenCursor;

impl PageCursor for TokenCursor {
    fn next_request(
        &self,
        request: &PageRequest,
        body: &Value,
    ) -> FetchResult<Option<PageRequest>> {
        match body.pointer("/pagination/cursor").and_then(Value::as_str) {
            Some(token) if !token.is_empty() => {
                let url = with_query_param(&request.url, AFTER_PARAM, token);
                Ok(Some(request.with_url(url)))
            }
            _ => Ok(None),
        }
    }
}

/// For endpoints without pagination metadata
#[derive(Debug, Clone, Copy, Default)]
pub struct SinglePageCursor;

impl PageCursor for SinglePageCursor {
    fn next_request(&self, _: &PageRequest, _: &Value) -> FetchResult<Option<PageRequest>> {
        Ok(None)
    }
}

/// Returns the cursor implementing a configured pagination style
pub fn cursor_for(style: PaginationStyle) -> Arc<dyn PageCursor> {
    match style {
        PaginationStyle::Link => Arc::new(LinkCursor),
        PaginationStyle::PageNumber => Arc::new(PageNumberCursor),
        PaginationStyle::Token => Arc::new(TokenCursor),
        PaginationStyle::Single => Arc::new(SinglePageCursor),
    }
}

/// Encodes page parameters as base64url minified JSON
pub fn encode_r(params: &Map<String, Value>) -> String {
    URL_SAFE_NO_PAD.encode(Value::Object(params.clone()).to_string())
}

/// Decodes an `_r` value into its parameter object
///
/// Padded input is accepted.
pub fn decode_r(encoded: &str) -> Result<Map<String, Value>, String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|e| format!("_r is not valid base64url: {}", e))?;
    match serde_json::from_slice(&bytes) {
        Ok(Value::Object(params)) => Ok(params),
        Ok(other) => Err(format!("_r is not a JSON object: {}", other)),
        Err(e) => Err(format!("_r is not valid JSON: {}", e)),
    }
}

fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// Returns `url` with `name` set to `value`, keeping every other parameter
pub fn with_query_param(url: &Url, name: &str, value: &str) -> Url {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != name)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    pairs.push((name.to_string(), value.to_string()));

    let mut next = url.clone();
    next.query_pairs_mut().clear().extend_pairs(pairs);
    next
}
