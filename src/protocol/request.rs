use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::core::{GatewayError, GatewayResult};

// Well known params
pub const PARAM_MEETING_ID: &str = "meetingID";
pub const PARAM_CHECKSUM: &str = "checksum";
pub const PARAM_RECORD_ID: &str = "recordID";
pub const PARAM_DISABLED_FEATURES: &str = "disabledFeatures";
pub const PARAM_META_FRONTEND: &str = "meta_frontend";

static RE_QUERY_CHECKSUM: Lazy<Regex> = Lazy::new(|| {
    Regex::new("&checksum(=[^&]*)?|^checksum(=[^&]*)?&?").expect("checksum pattern is valid")
});

/// The room server API resources the gateway understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Resource {
    Index,
    Join,
    Create,
    IsMeetingRunning,
    End,
    GetMeetingInfo,
    GetMeetings,
    GetRecordings,
    PublishRecordings,
    DeleteRecordings,
    UpdateRecordings,
    GetDefaultConfigXml,
    SetConfigXml,
    GetRecordingTextTracks,
    PutRecordingTextTrack,
}

impl Resource {
    pub const ALL: [Resource; 15] = [
        Resource::Index,
        Resource::Join,
        Resource::Create,
        Resource::IsMeetingRunning,
        Resource::End,
        Resource::GetMeetingInfo,
        Resource::GetMeetings,
        Resource::GetRecordings,
        Resource::PublishRecordings,
        Resource::DeleteRecordings,
        Resource::UpdateRecordings,
        Resource::GetDefaultConfigXml,
        Resource::SetConfigXml,
        Resource::GetRecordingTextTracks,
        Resource::PutRecordingTextTrack,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Index => "",
            Resource::Join => "join",
            Resource::Create => "create",
            Resource::IsMeetingRunning => "isMeetingRunning",
            Resource::End => "end",
            Resource::GetMeetingInfo => "getMeetingInfo",
            Resource::GetMeetings => "getMeetings",
            Resource::GetRecordings => "getRecordings",
            Resource::PublishRecordings => "publishRecordings",
            Resource::DeleteRecordings => "deleteRecordings",
            Resource::UpdateRecordings => "updateRecordings",
            Resource::GetDefaultConfigXml => "getDefaultConfigXML",
            Resource::SetConfigXml => "setConfigXML",
            Resource::GetRecordingTextTracks => "getRecordingTextTracks",
            Resource::PutRecordingTextTrack => "putRecordingTextTrack",
        }
    }

    /// Responses of these resources are collections or aggregate
    /// flags and can be merged.
    pub fn is_mergeable(&self) -> bool {
        self.fans_out()
            || matches!(
                self,
                Resource::UpdateRecordings | Resource::GetRecordingTextTracks
            )
    }

    /// Resources answered by every eligible backend and merged.
    pub fn fans_out(&self) -> bool {
        matches!(
            self,
            Resource::GetMeetings
                | Resource::GetRecordings
                | Resource::PublishRecordings
                | Resource::DeleteRecordings
        )
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resource {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Resource::ALL
            .iter()
            .find(|r| r.as_str() == s)
            .copied()
            .ok_or_else(|| GatewayError::NotFound(format!("unknown resource '{s}'")))
    }
}

impl TryFrom<String> for Resource {
    type Error = GatewayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Resource> for String {
    fn from(value: Resource) -> Self {
        value.as_str().to_string()
    }
}

/// Query parameters of a request, kept sorted so the
/// signed query string is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(BTreeMap<String, String>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an url encoded query string.
    pub fn from_query(query: &str) -> Self {
        Params(
            url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect(),
        )
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn meeting_id(&self) -> Option<&str> {
        self.get(PARAM_MEETING_ID)
    }

    /// Some resources accept a comma separated list of meetings.
    pub fn meeting_ids(&self) -> Option<Vec<String>> {
        self.meeting_id().map(|ids| {
            ids.split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(String::from)
                .collect()
        })
    }

    pub fn checksum(&self) -> Option<&str> {
        self.get(PARAM_CHECKSUM)
    }

    /// Encode as query string, sorted by key and without the checksum.
    pub fn query_string(&self) -> String {
        self.0
            .iter()
            .filter(|(k, _)| k.as_str() != PARAM_CHECKSUM)
            .map(|(k, v)| {
                let value: String = url::form_urlencoded::byte_serialize(v.as_bytes()).collect();
                format!("{k}={value}")
            })
            .collect::<Vec<_>>()
            .join("&")
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Params {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Params(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A decoded room server API request. It can be passed on
/// to a backend as it is, after being signed with the
/// backend secret.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub headers: HeaderMap,
    pub resource: Resource,
    pub params: Params,
    pub body: Option<Bytes>,
    pub checksum: String,
    /// Path and query the request arrived on.
    pub url: String,
}

impl Request {
    pub fn new(resource: Resource, params: Params) -> Self {
        let checksum = params.checksum().unwrap_or_default().to_string();
        Self {
            method: Method::GET,
            headers: HeaderMap::new(),
            resource,
            params,
            body: None,
            checksum,
            url: String::new(),
        }
    }

    pub fn create(params: Params, body: Option<Bytes>) -> Self {
        let mut req = Self::new(Resource::Create, params);
        if body.is_some() {
            req.method = Method::POST;
            req.set_content_type("application/xml");
        }
        req.body = body;
        req
    }

    pub fn has_body(&self) -> bool {
        self.body.as_ref().is_some_and(|b| !b.is_empty())
    }

    pub fn set_content_type(&mut self, value: &'static str) {
        self.headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(value));
    }

    fn checksum_sha1(&self, query: &str, secret: &str) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.resource.as_str());
        hasher.update(query);
        hasher.update(secret);
        hex::encode(hasher.finalize())
    }

    fn checksum_sha256(&self, query: &str, secret: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.resource.as_str());
        hasher.update(query);
        hasher.update(secret);
        hex::encode(hasher.finalize())
    }

    /// Sign the request params with a backend secret.
    pub fn sign(&self, secret: &str) -> String {
        self.checksum_sha256(&self.params.query_string(), secret)
    }

    /// Verify the checksum against the raw query string the request
    /// arrived with and the frontend secret.
    pub fn verify(&self, secret: &str) -> GatewayResult<()> {
        let raw_query = self.url.split_once('?').map(|(_, q)| q).unwrap_or_default();
        let query = RE_QUERY_CHECKSUM.replace_all(raw_query, "");

        let expected = if self.checksum.len() > 40 {
            self.checksum_sha256(&query, secret)
        } else {
            self.checksum_sha1(&query, secret)
        };

        if constant_time_eq(expected.as_bytes(), self.checksum.as_bytes()) {
            Ok(())
        } else {
            Err(GatewayError::Unauthorized("invalid checksum".to_string()))
        }
    }

    /// Build the signed URL of this request on a backend.
    pub fn url_for(&self, host: &str, secret: &str) -> String {
        let mut base = host.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let query = self.params.query_string();
        let checksum = self.sign(secret);
        if query.is_empty() {
            format!("{base}{}?checksum={checksum}", self.resource)
        } else {
            format!("{base}{}?{query}&checksum={checksum}", self.resource)
        }
    }

    /// Encode the request as unpadded url safe base64 json.
    /// The encoding is not signed.
    pub fn marshal_url_safe(&self) -> GatewayResult<String> {
        let mut hdr: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in self.headers.iter() {
            if let Ok(value) = value.to_str() {
                hdr.entry(name.as_str().to_string())
                    .or_default()
                    .push(value.to_string());
            }
        }
        let repr = UrlSafeRequest {
            mth: self.method.as_str().to_string(),
            hdr,
            res: self.resource,
            prm: self.params.clone(),
            url: self.url.clone(),
        };
        let data = serde_json::to_vec(&repr)?;
        Ok(URL_SAFE_NO_PAD.encode(data))
    }

    /// Decode a request produced by [`Request::marshal_url_safe`].
    /// The result must not be trusted without verification.
    pub fn unmarshal_url_safe(data: &str) -> GatewayResult<Self> {
        let payload = URL_SAFE_NO_PAD.decode(data.trim_end_matches('='))?;
        let repr: UrlSafeRequest = serde_json::from_slice(&payload)?;

        let method = Method::from_bytes(repr.mth.as_bytes())
            .map_err(|e| GatewayError::Serialization(e.to_string()))?;
        let mut headers = HeaderMap::new();
        for (name, values) in repr.hdr {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| GatewayError::Serialization(e.to_string()))?;
            for value in values {
                let value = HeaderValue::from_str(&value)
                    .map_err(|e| GatewayError::Serialization(e.to_string()))?;
                headers.append(name.clone(), value);
            }
        }

        let mut req = Request::new(repr.res, repr.prm);
        req.method = method;
        req.headers = headers;
        req.url = repr.url;
        Ok(req)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Request {} {}?{}]",
            self.method,
            self.resource,
            self.params.query_string()
        )
    }
}

#[derive(Serialize, Deserialize)]
struct UrlSafeRequest {
    mth: String,
    #[serde(default)]
    hdr: BTreeMap<String, Vec<String>>,
    res: Resource,
    #[serde(default)]
    prm: Params,
    #[serde(default)]
    url: String,
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    #[test]
    fn test_resource_names() {
        for resource in Resource::ALL {
            assert_eq!(resource.as_str().parse::<Resource>().unwrap(), resource);
        }
        assert!("nope".parse::<Resource>().is_err());
        assert!(Resource::GetMeetings.fans_out());
        assert!(!Resource::Create.fans_out());
        assert!(Resource::UpdateRecordings.is_mergeable());
        assert!(!Resource::Join.is_mergeable());
    }

    #[test]
    fn test_query_string_is_sorted_without_checksum() {
        let p = params(&[
            ("name", "Room 1"),
            ("meetingID", "abc"),
            ("checksum", "deadbeef"),
        ]);
        assert_eq!(p.query_string(), "meetingID=abc&name=Room+1");
    }

    #[test]
    fn test_meeting_ids() {
        let p = params(&[("meetingID", "a, b,,c")]);
        assert_eq!(p.meeting_ids().unwrap(), vec!["a", "b", "c"]);
        assert!(Params::new().meeting_ids().is_none());
    }

    #[test]
    fn test_sign_and_url() {
        let req = Request::new(Resource::Join, params(&[("meetingID", "m1")]));
        let checksum = req.sign("secret");
        let expected = hex::encode(Sha256::digest(b"joinmeetingID=m1secret"));
        assert_eq!(checksum, expected);

        let url = req.url_for("https://bbb1.example.com/bigbluebutton/api", "secret");
        assert_eq!(
            url,
            format!("https://bbb1.example.com/bigbluebutton/api/join?meetingID=m1&checksum={expected}")
        );
    }

    #[test]
    fn test_verify_sha1_and_sha256() {
        let query = "meetingID=m1&name=Room+1";
        let sha1 = hex::encode(Sha1::digest(format!("create{query}secret").as_bytes()));
        let mut req = Request::new(Resource::Create, Params::from_query(query));
        req.url = format!("/bbb/fe1/api/create?{query}&checksum={sha1}");
        req.checksum = sha1;
        assert!(req.verify("secret").is_ok());
        assert!(req.verify("other").is_err());

        let sha256 = hex::encode(Sha256::digest(format!("create{query}secret").as_bytes()));
        req.url = format!("/bbb/fe1/api/create?checksum={sha256}&{query}");
        req.checksum = sha256;
        assert!(req.verify("secret").is_ok());
    }

    #[test]
    fn test_url_safe_encoding() {
        let mut req = Request::new(
            Resource::Join,
            params(&[("meetingID", "m1"), ("fullName", "Jane Doe")]),
        );
        req.url = "/bbb/fe1/api/join?meetingID=m1&fullName=Jane+Doe&checksum=x".into();
        req.headers
            .insert(header::USER_AGENT, HeaderValue::from_static("test"));

        let encoded = req.marshal_url_safe().unwrap();
        assert!(!encoded.contains('/') && !encoded.contains('+') && !encoded.contains('='));

        let decoded = Request::unmarshal_url_safe(&encoded).unwrap();
        assert_eq!(decoded.resource, Resource::Join);
        assert_eq!(decoded.params, req.params);
        assert_eq!(decoded.url, req.url);
        assert_eq!(decoded.headers.get(header::USER_AGENT).unwrap(), "test");

        assert!(Request::unmarshal_url_safe("not json!").is_err());
    }
}
