use super::url_encode::encode;

/// Announce events the tracker distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Completed,
    Stopped,
}

impl AnnounceEvent {
    fn as_str(&self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Completed => "completed",
            AnnounceEvent::Stopped => "stopped",
        }
    }
}

/// Query string builder for an announce request.
#[derive(Debug)]
pub struct QueryParams {
    info_hash: String,
    client_peer_id: String,
    client_port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<AnnounceEvent>,
}

impl QueryParams {
    pub fn new(info_hash: String, client_peer_id: String, client_port: u16) -> QueryParams {
        QueryParams {
            info_hash,
            client_peer_id,
            client_port,
            uploaded: 0,
            downloaded: 0,
            left: 0,
            event: None,
        }
    }

    /// Builds the query string, info-hash percent-encoded.
    pub fn build(&self) -> String {
        let mut query = format!(
            "?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            encode(self.info_hash.as_str()),
            self.client_peer_id,
            self.client_port,
            self.uploaded,
            self.downloaded,
            self.left,
        );
        if let Some(event) = self.event {
            query.push_str("&event=");
            query.push_str(event.as_str());
        }
        query
    }
}
