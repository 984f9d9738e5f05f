//! ---
//! hydra_section: "02-messaging-envelope"
//! hydra_subsection: "module"
//! hydra_type: "source"
//! hydra_scope: "code"
//! hydra_description: "UMF envelope model, wire codec and route grammar."
//! hydra_version: "v0.1.0"
//! hydra_owner: "tbd"
//! ---
//! Routing address grammar: `[instance[-subId]@]service:[[method]]apiRoute`.

use std::fmt;

/// Structured reason a routing address failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    /// The address was the empty string.
    #[error("route is empty")]
    Empty,
    /// No `:` separated the service from the api route.
    #[error("route field has invalid number of routable segments")]
    InvalidSegments,
    /// Only one of `[` / `]` was present, or they were out of order.
    #[error("route has mismatched http [ or ] brackets")]
    MismatchedBrackets,
}

/// Parsed routing address.
///
/// Parsing never fails outright: a malformed address yields an entry whose
/// [`error`](RouteEntry::error) is set and whose other fields are blank.
/// Callers must check [`RouteEntry::is_valid`] before routing on it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteEntry {
    /// Instance id pinning the address to a single process, or empty.
    pub instance: String,
    /// Sub id following `-` in the instance prefix, or empty.
    pub sub_id: String,
    /// Target service name.
    pub service_name: String,
    /// Method from the bracket fragment, or empty.
    pub http_method: String,
    /// Path following the service (and optional method).
    pub api_route: String,
    /// Parse failure, if any.
    pub error: Option<RouteError>,
}

impl RouteEntry {
    fn failed(error: RouteError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    /// True when the address parsed without error.
    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }

    /// True when the address pins a specific instance.
    pub fn has_instance(&self) -> bool {
        !self.instance.is_empty()
    }

    /// Return the entry, or its parse error.
    pub fn into_result(self) -> std::result::Result<Self, RouteError> {
        match self.error.clone() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(err) = &self.error {
            return write!(f, "<invalid route: {err}>");
        }
        if self.has_instance() {
            f.write_str(&self.instance)?;
            if !self.sub_id.is_empty() {
                write!(f, "-{}", self.sub_id)?;
            }
            f.write_str("@")?;
        }
        write!(f, "{}:", self.service_name)?;
        if !self.http_method.is_empty() {
            write!(f, "[{}]", self.http_method)?;
        }
        f.write_str(&self.api_route)
    }
}

/// Parse a routing address.
///
/// ```
/// use hydra_msg::parse_route;
///
/// let entry = parse_route("de571e9695c24c0eb12834ae5ee2f404-8u0f9wls7r@hydra-router:[get]/");
/// assert_eq!(entry.instance, "de571e9695c24c0eb12834ae5ee2f404");
/// assert_eq!(entry.sub_id, "8u0f9wls7r");
/// assert_eq!(entry.service_name, "hydra-router");
/// assert_eq!(entry.http_method, "get");
/// assert_eq!(entry.api_route, "/");
/// ```
pub fn parse_route(route: &str) -> RouteEntry {
    if route.is_empty() {
        return RouteEntry::failed(RouteError::Empty);
    }
    let Some((target, path)) = route.split_once(':') else {
        return RouteEntry::failed(RouteError::InvalidSegments);
    };

    let mut entry = RouteEntry::default();
    match target.split_once('@') {
        None => entry.service_name = target.to_owned(),
        Some((prefix, service)) => {
            match prefix.split_once('-') {
                Some((instance, sub_id)) => {
                    entry.instance = instance.to_owned();
                    // further dashes belong to nothing addressable
                    entry.sub_id = sub_id.split('-').next().unwrap_or_default().to_owned();
                }
                None => entry.instance = prefix.to_owned(),
            }
            entry.service_name = service.split('@').next().unwrap_or_default().to_owned();
        }
    }

    match (path.find('['), path.find(']')) {
        (Some(lb), Some(rb)) if lb < rb => {
            entry.http_method = path[lb + 1..rb].to_owned();
            entry.api_route = path[rb + 1..].to_owned();
        }
        (None, None) => entry.api_route = path.to_owned(),
        _ => return RouteEntry::failed(RouteError::MismatchedBrackets),
    }
    entry
}
