//! ---
//! hydra_section: "02-messaging-envelope"
//! hydra_subsection: "module"
//! hydra_type: "source"
//! hydra_scope: "code"
//! hydra_description: "UMF envelope model, wire codec and route grammar."
//! hydra_version: "v0.1.0"
//! hydra_owner: "tbd"
//! ---
//! Envelope model and its JSON wire form.
//!
//! Outbound envelopes always serialize with the canonical lower-case field
//! names (`to, frm, mid, rmid, typ, ver, ts, bdy`). Inbound envelopes are
//! matched case-insensitively and decoded in two phases: the header is read
//! against an untyped body first, and [`ReceivedUmf::cast`] re-decodes the
//! body against a concrete shape on demand.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::route::{parse_route, RouteEntry};
use crate::{MsgError, Result};

/// Protocol version stamped on every envelope.
pub const UMF_VERSION: &str = "UMF/1.4.6";

fn new_mid() -> String {
    Uuid::new_v4().to_string()
}

fn default_version() -> String {
    UMF_VERSION.to_owned()
}

mod timestamp {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{raw}'")))
    }

    /// Accepts RFC 3339 as well as offset-less ISO 8601, which is read as UTC.
    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts.with_timezone(&Utc));
        }
        ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%SZ"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
            .map(|naive| naive.and_utc())
    }
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

/// A UMF envelope with a body of type `B`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Umf<B = JsonValue> {
    /// Routing address of the recipient.
    #[serde(default)]
    pub to: String,
    /// Routing address of the sender.
    #[serde(default)]
    pub frm: String,
    /// Unique message id.
    #[serde(default = "new_mid")]
    pub mid: String,
    /// Id of the message this envelope replies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rmid: Option<String>,
    /// Type discriminator used for dispatch.
    #[serde(default)]
    pub typ: String,
    /// Protocol version.
    #[serde(default = "default_version")]
    pub ver: String,
    /// Creation time, UTC.
    #[serde(default = "now", with = "timestamp")]
    pub ts: DateTime<Utc>,
    /// Message payload.
    pub bdy: B,
}

impl<B> Umf<B> {
    /// Create an envelope with a fresh id and timestamp. `frm` is left empty.
    pub fn new(to: impl Into<String>, typ: impl Into<String>, bdy: B) -> Self {
        Self {
            to: to.into(),
            frm: String::new(),
            mid: new_mid(),
            rmid: None,
            typ: typ.into(),
            ver: default_version(),
            ts: Utc::now(),
            bdy,
        }
    }

    /// Set the sender address.
    pub fn with_from(mut self, frm: impl Into<String>) -> Self {
        self.frm = frm.into();
        self
    }

    /// Mark this envelope as a reply to `rmid`.
    pub fn with_rmid(mut self, rmid: impl Into<String>) -> Self {
        self.rmid = Some(rmid.into());
        self
    }

    /// Parse the recipient address.
    pub fn route(&self) -> RouteEntry {
        parse_route(&self.to)
    }

    /// Parse the sender address.
    pub fn from_route(&self) -> RouteEntry {
        parse_route(&self.frm)
    }

    /// Replace the body, keeping every header field.
    pub fn map_body<T>(self, f: impl FnOnce(B) -> T) -> Umf<T> {
        Umf {
            to: self.to,
            frm: self.frm,
            mid: self.mid,
            rmid: self.rmid,
            typ: self.typ,
            ver: self.ver,
            ts: self.ts,
            bdy: f(self.bdy),
        }
    }
}

impl<B: Serialize> Umf<B> {
    /// Serialize to canonical wire JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Convert into an envelope with an untyped body.
    pub fn to_untyped(&self) -> Result<Umf<JsonValue>> {
        let bdy = serde_json::to_value(&self.bdy)?;
        Ok(Umf {
            to: self.to.clone(),
            frm: self.frm.clone(),
            mid: self.mid.clone(),
            rmid: self.rmid.clone(),
            typ: self.typ.clone(),
            ver: self.ver.clone(),
            ts: self.ts,
            bdy,
        })
    }
}

impl<B: DeserializeOwned> Umf<B> {
    /// Decode wire JSON, matching header names case-insensitively.
    pub fn from_json(json: &str) -> Result<Self> {
        let value: JsonValue = serde_json::from_str(json)?;
        Ok(serde_json::from_value(normalize_header(value)?)?)
    }
}

/// Lower-case top-level keys so producers with other casing still decode.
/// Body contents are left untouched.
fn normalize_header(value: JsonValue) -> Result<JsonValue> {
    let JsonValue::Object(map) = value else {
        return Err(MsgError::NotAnObject);
    };
    let mut normalized = Map::with_capacity(map.len());
    for (key, value) in map {
        normalized.insert(key.to_ascii_lowercase(), value);
    }
    normalized.entry("bdy").or_insert(JsonValue::Null);
    Ok(JsonValue::Object(normalized))
}

/// An envelope decoded from the wire alongside its original text.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedUmf {
    umf: Umf<JsonValue>,
    raw: String,
}

impl ReceivedUmf {
    /// First decode phase: header plus untyped body.
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let umf = Umf::<JsonValue>::from_json(&raw)?;
        Ok(Self { umf, raw })
    }

    /// Decoded envelope with an untyped body.
    pub fn umf(&self) -> &Umf<JsonValue> {
        &self.umf
    }

    /// Wire text exactly as received.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Second decode phase: interpret the body as `T`.
    pub fn cast<T: DeserializeOwned>(&self) -> Result<Umf<T>> {
        let bdy = T::deserialize(&self.umf.bdy)?;
        Ok(self.umf.clone().map_body(|_| bdy))
    }

    /// Consume into the untyped envelope.
    pub fn into_umf(self) -> Umf<JsonValue> {
        self.umf
    }
}

/// What inbound handlers and correlation waiters receive.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// The envelope's `typ`, lifted for cheap dispatch.
    pub typ: String,
    /// Decoded envelope with its raw text.
    pub received: ReceivedUmf,
}

impl InboundMessage {
    /// Decode an inbound wire message.
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        Ok(Self::from(ReceivedUmf::parse(raw)?))
    }

    /// Decoded envelope with an untyped body.
    pub fn umf(&self) -> &Umf<JsonValue> {
        self.received.umf()
    }

    /// Wire text exactly as received.
    pub fn raw(&self) -> &str {
        self.received.raw()
    }

    /// Interpret the body as `T`.
    pub fn cast<T: DeserializeOwned>(&self) -> Result<Umf<T>> {
        self.received.cast()
    }
}

impl From<ReceivedUmf> for InboundMessage {
    fn from(received: ReceivedUmf) -> Self {
        Self {
            typ: received.umf.typ.clone(),
            received,
        }
    }
}
