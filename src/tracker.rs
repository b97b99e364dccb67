//! The HTTP tracker client: periodic announces that report our download
//! progress and return the current peer list.

use {
    percent_encoding::{percent_encode, NON_ALPHANUMERIC},
    serde_bencode::value::Value,
    std::{
        net::{IpAddr, Ipv4Addr, SocketAddr},
        time::Duration,
    },
    url::Url,
};

use crate::{
    error::{Error, Result},
    PeerId, Sha1Hash,
};

/// The optional event field of an announce.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Event {
    /// Sent with the first announce of a download only.
    Started,
}

impl Event {
    fn as_str(self) -> &'static str {
        match self {
            Event::Started => "started",
        }
    }
}

/// A successful announce: how long to wait until the next one and the
/// tracker's current peer list.
#[derive(Debug)]
pub(crate) struct AnnounceResponse {
    pub interval: Duration,
    pub peers: Vec<SocketAddr>,
}

/// The bencoded body of the tracker's HTTP response. The peer list is kept as
/// a generic bencode value as trackers may send it in two shapes, of which
/// only the compact byte string model is supported.
#[derive(Debug, Deserialize)]
struct Response {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    interval: Option<u64>,
    peers: Option<Value>,
}

pub(crate) struct Tracker {
    client: reqwest::Client,
    announce_url: Url,
    info_hash: Sha1Hash,
    client_id: PeerId,
    port: u16,
}

impl Tracker {
    pub fn new(
        announce: &str,
        info_hash: Sha1Hash,
        client_id: PeerId,
        port: u16,
    ) -> Result<Self> {
        let announce_url = Url::parse(announce).map_err(|e| {
            Error::MalformedTorrent(format!("invalid announce url: {}", e))
        })?;
        Ok(Self {
            client: reqwest::Client::new(),
            announce_url,
            info_hash,
            client_id,
            port,
        })
    }

    /// Performs one announce, reporting our transfer counters and returning
    /// the tracker's announce interval and peer list.
    pub async fn announce(
        &self,
        downloaded: u64,
        uploaded: u64,
        event: Option<Event>,
    ) -> Result<AnnounceResponse> {
        let mut url = self.announce_url.clone();
        // the info hash and peer id are raw bytes, so they have to be percent
        // encoded by hand and with them the rest of the query string
        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}\
             &compact=1",
            percent_encode(&self.info_hash, NON_ALPHANUMERIC),
            percent_encode(&self.client_id, NON_ALPHANUMERIC),
            self.port,
            uploaded,
            downloaded,
        );
        if let Some(event) = event {
            query.push_str("&event=");
            query.push_str(event.as_str());
        }
        // announce urls may already carry query parameters
        if let Some(existing) = url.query() {
            query = format!("{}&{}", existing, query);
        }
        url.set_query(Some(&query));

        log::debug!("Announcing to tracker: {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Tracker(e.to_string()))?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(Error::Tracker(format!(
                "announce returned HTTP status {}",
                status
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Tracker(e.to_string()))?;

        let response: Response =
            serde_bencode::from_bytes(&body).map_err(|e| {
                Error::Tracker(format!("invalid announce response: {}", e))
            })?;
        if let Some(reason) = response.failure_reason {
            return Err(Error::Tracker(reason));
        }
        let interval = response.interval.ok_or_else(|| {
            Error::Tracker("announce response without interval".into())
        })?;
        let peers = match response.peers {
            Some(Value::Bytes(peers)) => parse_compact_peers(&peers)?,
            Some(Value::List(_)) => return Err(Error::PeerListNotSupported),
            Some(_) => {
                return Err(Error::Tracker(
                    "unexpected peers shape in announce response".into(),
                ))
            }
            None => Vec::new(),
        };
        log::debug!("Tracker returned peers: {:?}", peers);

        Ok(AnnounceResponse {
            interval: Duration::from_secs(interval),
            peers,
        })
    }
}

/// Parses the compact peer list: 6 bytes per peer, an IPv4 address followed
/// by a big endian port.
fn parse_compact_peers(raw: &[u8]) -> Result<Vec<SocketAddr>> {
    if raw.len() % 6 != 0 {
        return Err(Error::Tracker(format!(
            "compact peer list length {} is not a multiple of 6",
            raw.len()
        )));
    }
    Ok(raw
        .chunks_exact(6)
        .map(|entry| {
            let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
            let port = u16::from_be_bytes([entry[4], entry[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect())
}
