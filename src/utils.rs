use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::{Rng, RngCore, rngs::OsRng};
use url::form_urlencoded;

use crate::error::{Error, Result};

/// Protocol version carried in the `wc:` URI.
pub const VERSION: &str = "1";

pub fn random_bytes32() -> [u8; 32] {
    let mut random_value = [0u8; 32];
    OsRng.fill_bytes(&mut random_value);
    random_value
}

/// Generates a JSON-RPC payload id: unix milliseconds scaled by 1000 plus
/// three random digits, so concurrent requests get distinct ids.
pub fn payload_id() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards");

    let date_ms = now.as_millis() as i64;
    let extra: i64 = rand::thread_rng().gen_range(0..1000);

    date_ms * 1000 + extra
}

/// A string is hex if it carries the `0x` prefix followed by at least one
/// hex digit. Used by the signing operations to decide whether a message
/// still needs encoding before it goes on the wire.
pub fn is_hex(value: &str) -> bool {
    value
        .strip_prefix("0x")
        .map(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_hexdigit()))
        .unwrap_or(false)
}

pub fn url_encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Composes the connection hand-off URI:
/// `wc:<topic>@<version>?bridge=<url>&key=<hex>`.
pub fn build_uri(handshake_topic: &str, bridge_url: &str, key: &str) -> String {
    format!(
        "wc:{}@{}?bridge={}&key={}",
        url_encode(handshake_topic),
        url_encode(VERSION),
        url_encode(bridge_url),
        url_encode(key)
    )
}

#[derive(Debug, PartialEq)]
pub struct UriParameters {
    pub topic: String,
    pub version: u32,
    pub bridge_url: String,
    pub key: String,
}

pub fn parse_uri(input: &str) -> Result<UriParameters> {
    let input = input
        .strip_prefix("wc:")
        .ok_or(Error::Format("uri must start with wc:"))?;

    let query_start = input
        .find('?')
        .ok_or(Error::Format("uri query string not found"))?;
    let path = &input[..query_start];
    let query_string = &input[query_start + 1..];

    let required_values: Vec<&str> = path.split('@').collect();
    if required_values.len() != 2 {
        return Err(Error::Format("uri path must be topic@version"));
    }

    let mut query_params: HashMap<String, String> = HashMap::new();
    for (key, value) in form_urlencoded::parse(query_string.as_bytes()) {
        query_params.insert(key.into(), value.into());
    }

    Ok(UriParameters {
        topic: required_values[0].to_string(),
        version: required_values[1]
            .parse()
            .map_err(|_| Error::Format("uri version is not a number"))?,
        bridge_url: query_params
            .get("bridge")
            .ok_or(Error::Format("bridge url not mentioned in uri"))?
            .to_string(),
        key: query_params
            .get("key")
            .ok_or(Error::Format("key not mentioned in uri"))?
            .to_string(),
    })
}
