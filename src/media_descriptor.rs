//! Media descriptor: a URI plus the parsed `{container, sink-kind}` pair that
//! [`crate::endpoint::dynamic::DynamicEndpoint`] uses to pick a concrete
//! endpoint (spec.md §3, §6).

use url::Url;

use crate::error::{Error, Result};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Container {
    Mp4,
    Ts,
    Flv,
    ThreeGp,
    WebM,
    Ogg,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SinkKind {
    File,
    Content,
    Srt,
    Rtmp,
}

/// Freeform key/value data carried alongside a descriptor, e.g. MPEG-TS
/// service identification supplied out-of-band (spec.md §4.6:
/// "TS services installed from `descriptor.custom_data` if present").
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CustomData(Vec<(String, String)>);

impl CustomData {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MediaDescriptor {
    pub uri: Url,
    pub container: Container,
    pub sink_kind: SinkKind,
    pub custom_data: CustomData,
}

impl MediaDescriptor {
    /// Parses a media descriptor URI per spec.md §6:
    /// *   `file:` paths: container inferred from extension.
    /// *   `content:` URIs: container inferred from MIME query param `type`.
    /// *   `srt://host:port?streamid=...&passphrase=...`.
    /// *   `rtmp://host[:port]/app/stream`.
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri)
            .map_err(|e| Error::with_source(crate::error::ErrorKind::InvalidState, format!("invalid media uri {:?}", uri), e))?;
        let (container, sink_kind) = match url.scheme() {
            "file" => (container_from_extension(url.path())?, SinkKind::File),
            "content" => (container_from_content_mime(&url)?, SinkKind::Content),
            "srt" => (Container::Ts, SinkKind::Srt),
            "rtmp" => (Container::Flv, SinkKind::Rtmp),
            other => return Err(Error::unsupported_container(format!("unsupported scheme {:?}", other))),
        };
        Ok(MediaDescriptor { uri: url, container, sink_kind, custom_data: CustomData::default() })
    }

    pub fn with_custom_data(mut self, custom_data: CustomData) -> Self {
        self.custom_data = custom_data;
        self
    }
}

fn container_from_extension(path: &str) -> Result<Container> {
    let ext = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    Ok(match ext.as_str() {
        "mp4" => Container::Mp4,
        "ts" => Container::Ts,
        "flv" => Container::Flv,
        "3gp" | "3gpp" => Container::ThreeGp,
        "webm" => Container::WebM,
        "ogg" => Container::Ogg,
        other => return Err(Error::unsupported_container(format!("unrecognized file extension {:?}", other))),
    })
}

fn container_from_content_mime(url: &Url) -> Result<Container> {
    // `content:` URIs don't carry a MIME type in the URI grammar itself;
    // callers pass it as a `type` query parameter, matching how the rest of
    // this crate treats media descriptors as pure data (no content-resolver
    // collaborator is in scope; spec.md §1 excludes UI/platform content
    // resolution from this core).
    let mime = url
        .query_pairs()
        .find(|(k, _)| k == "type")
        .map(|(_, v)| v.into_owned())
        .ok_or_else(|| Error::unsupported_container("content: uri missing type= query parameter"))?;
    Ok(match mime.as_str() {
        "video/mp4" => Container::Mp4,
        "video/x-flv" => Container::Flv,
        "video/mp2ts" => Container::Ts,
        "video/webm" => Container::WebM,
        "audio/ogg" | "video/ogg" => Container::Ogg,
        "video/3gpp" => Container::ThreeGp,
        other => return Err(Error::unsupported_container(format!("unrecognized mime {:?}", other))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_extension_dispatch() {
        let cases = [
            ("file:///tmp/out.mp4", Container::Mp4),
            ("file:///tmp/out.ts", Container::Ts),
            ("file:///tmp/out.flv", Container::Flv),
            ("file:///tmp/out.3gp", Container::ThreeGp),
            ("file:///tmp/out.webm", Container::WebM),
            ("file:///tmp/out.ogg", Container::Ogg),
        ];
        for (uri, want) in cases {
            let d = MediaDescriptor::parse(uri).unwrap();
            assert_eq!(d.container, want, "{uri}");
            assert_eq!(d.sink_kind, SinkKind::File);
        }
    }

    #[test]
    fn content_mime_dispatch() {
        let d = MediaDescriptor::parse("content://media/external/video?type=video%2Fmp4").unwrap();
        assert_eq!(d.container, Container::Mp4);
        assert_eq!(d.sink_kind, SinkKind::Content);
    }

    #[test]
    fn srt_uri_selects_ts_over_srt_sink() {
        let d = MediaDescriptor::parse("srt://example.com:9000?streamid=abc&passphrase=secret").unwrap();
        assert_eq!(d.container, Container::Ts);
        assert_eq!(d.sink_kind, SinkKind::Srt);
        let pairs: std::collections::HashMap<_, _> = d.uri.query_pairs().into_owned().collect();
        assert_eq!(pairs.get("streamid").unwrap(), "abc");
        assert_eq!(pairs.get("passphrase").unwrap(), "secret");
    }

    #[test]
    fn rtmp_uri_selects_flv_over_rtmp_sink() {
        let d = MediaDescriptor::parse("rtmp://example.com/live/stream_key").unwrap();
        assert_eq!(d.container, Container::Flv);
        assert_eq!(d.sink_kind, SinkKind::Rtmp);
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let err = MediaDescriptor::parse("file:///tmp/out.avi").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::UnsupportedContainer);
    }
}
