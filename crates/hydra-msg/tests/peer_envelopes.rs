//! ---
//! hydra_section: "02-messaging-envelope"
//! hydra_subsection: "module"
//! hydra_type: "source"
//! hydra_scope: "code"
//! hydra_description: "UMF envelope model, wire codec and route grammar."
//! hydra_version: "v0.1.0"
//! hydra_owner: "tbd"
//! ---
use anyhow::Result;
use hydra_msg::{parse_route, InboundMessage, RouteError, Umf};
use serde::Deserialize;

#[derive(Debug, Deserialize, PartialEq)]
struct Job {
    id: u64,
    #[serde(default)]
    tags: Vec<String>,
}

const NODE_REPLY: &str = r#"{
    "to": "1f0e7c2a@dispatcher:[post]/v1/jobs",
    "frm": "de571e9b@hydra-router:/",
    "mid": "7a2c6d8e-3f51-4c0b-9a1e-2b6f1f6c4d10",
    "rmid": "0b9f1a44-1c2d-4e5f-8a9b-0c1d2e3f4a5b",
    "typ": "job.accepted",
    "ver": "UMF/1.4.6",
    "ts": "2023-11-07T09:15:42.318+01:00",
    "bdy": {"id": 42, "tags": ["priority"]}
}"#;

#[test]
fn decodes_a_peer_reply_and_its_addresses() -> Result<()> {
    let msg = InboundMessage::parse(NODE_REPLY)?;
    assert_eq!(msg.typ, "job.accepted");
    assert_eq!(msg.raw(), NODE_REPLY);

    let umf = msg.umf();
    assert_eq!(umf.rmid.as_deref(), Some("0b9f1a44-1c2d-4e5f-8a9b-0c1d2e3f4a5b"));
    assert_eq!(umf.ts.to_rfc3339(), "2023-11-07T08:15:42.318+00:00");

    let to = umf.route().into_result()?;
    assert_eq!(to.instance, "1f0e7c2a");
    assert_eq!(to.service_name, "dispatcher");
    assert_eq!(to.http_method, "post");
    assert_eq!(to.api_route, "/v1/jobs");

    let frm = umf.from_route();
    assert!(frm.is_valid());
    assert_eq!(frm.service_name, "hydra-router");

    let job: Umf<Job> = msg.cast()?;
    assert_eq!(job.bdy, Job { id: 42, tags: vec!["priority".into()] });
    assert_eq!(job.mid, umf.mid);
    Ok(())
}

#[test]
fn body_shape_mismatch_fails_only_the_cast() -> Result<()> {
    let msg = InboundMessage::parse(r#"{"to":"svc:/","typ":"job","bdy":{"id":"not-a-number"}}"#)?;
    assert_eq!(msg.umf().ver, "UMF/1.4.6");
    assert!(msg.cast::<Job>().is_err());
    assert!(msg.cast::<serde_json::Value>().is_ok());
    Ok(())
}

#[test]
fn invalid_addresses_surface_on_the_envelope() {
    let umf = Umf::new("svc:[get/x", "ping", ());
    let route = umf.route();
    assert_eq!(route.error, Some(RouteError::MismatchedBrackets));
    assert!(route.service_name.is_empty());
    assert_eq!(parse_route("no-colon").error, Some(RouteError::InvalidSegments));
}
