//! Dialog state for a session
//!
//! Holds what RFC 3261 §12 requires to send and recognise requests within a
//! dialog: Call-ID, both tags, local and remote CSeq, remote target and route
//! set. A dialog is created from an incoming INVITE (UAS) or for an outgoing
//! one (UAC) and completed from the responses it receives.

use tracing::debug;

use crate::errors::{SessionError, SessionResult};
use crate::message::{Method, NameAddr, SipRequest, SipResponse};

/// Generate a random dialog tag
pub(crate) fn generate_tag() -> String {
    format!("{:08x}", rand::random::<u32>())
}

/// Request-URI named by a Contact value
///
/// `"Bob" <sip:bob@host>;expires=60` gives `sip:bob@host`.
pub(crate) fn contact_uri(contact: &str) -> String {
    let contact = contact.trim();
    match (contact.find('<'), contact.find('>')) {
        (Some(start), Some(end)) if start < end => contact[start + 1..end].to_string(),
        _ => contact.split(';').next().unwrap_or(contact).trim().to_string(),
    }
}

fn initial_cseq() -> u32 {
    // RFC 3261 §8.1.1.5: below 2^31
    rand::random::<u32>() & 0x7fff_ffff
}

/// A SIP dialog as seen by one session
#[derive(Debug, Clone)]
pub struct Dialog {
    call_id: String,
    local: NameAddr,
    remote: NameAddr,
    local_cseq: u32,
    remote_cseq: Option<u32>,
    remote_target: String,
    route_set: Vec<String>,
    confirmed: bool,
}

impl Dialog {
    /// Create the UAS side of a dialog from an incoming INVITE
    pub fn accept(request: &SipRequest) -> SessionResult<Self> {
        if request.method != Method::Invite {
            return Err(SessionError::invalid_argument(format!(
                "cannot accept a dialog from {}",
                request.method
            )));
        }
        if request.to.tag.is_some() {
            return Err(SessionError::invalid_argument("INVITE already belongs to a dialog"));
        }
        if request.from.tag.is_none() {
            return Err(SessionError::invalid_argument("INVITE missing From tag"));
        }
        let remote_target = request
            .contact
            .as_deref()
            .map(contact_uri)
            .ok_or_else(|| SessionError::invalid_argument("INVITE missing Contact"))?;

        let local = NameAddr {
            uri: request.to.uri.clone(),
            tag: Some(generate_tag()),
        };

        debug!(call_id = %request.call_id, local_tag = ?local.tag, "accepted dialog from INVITE");

        Ok(Self {
            call_id: request.call_id.clone(),
            local,
            remote: request.from.clone(),
            local_cseq: initial_cseq(),
            remote_cseq: Some(request.cseq.seq),
            remote_target,
            route_set: request.record_route.clone(),
            confirmed: false,
        })
    }

    /// Create the UAC side of a dialog for a new outgoing INVITE
    pub fn connect(from_uri: impl Into<String>, to_uri: impl Into<String>, request_uri: impl Into<String>) -> Self {
        Self {
            call_id: uuid::Uuid::new_v4().to_string(),
            local: NameAddr::new(from_uri).with_tag(generate_tag()),
            remote: NameAddr::new(to_uri),
            local_cseq: initial_cseq(),
            remote_cseq: None,
            remote_target: request_uri.into(),
            route_set: Vec::new(),
            confirmed: false,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn local_tag(&self) -> &str {
        self.local.tag.as_deref().unwrap_or_default()
    }

    pub fn remote_tag(&self) -> Option<&str> {
        self.remote.tag.as_deref()
    }

    pub fn remote_target(&self) -> &str {
        &self.remote_target
    }

    pub fn route_set(&self) -> &[String] {
        &self.route_set
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    /// Mark the dialog confirmed (a 2xx was sent or received)
    pub fn confirm(&mut self) {
        self.confirmed = true;
    }

    /// Allocate the next local CSeq number
    pub fn next_cseq(&mut self) -> u32 {
        self.local_cseq = self.local_cseq.wrapping_add(1);
        self.local_cseq
    }

    /// Point the dialog at a new remote target (3xx redirect)
    ///
    /// An early dialog also forgets the tag and route set learned from the
    /// previous target.
    pub fn retarget(&mut self, target: impl Into<String>) {
        self.remote_target = target.into();
        if !self.confirmed {
            self.remote.tag = None;
            self.route_set.clear();
        }
    }

    /// Build a new request within the dialog, consuming a CSeq number
    pub fn request(&mut self, method: Method) -> SipRequest {
        let cseq = self.next_cseq();
        let mut request = SipRequest::new(
            method,
            self.remote_target.clone(),
            self.call_id.clone(),
            cseq,
            self.local.clone(),
            self.remote.clone(),
        );
        request.route = self.route_set.clone();
        request
    }

    /// Build the ACK for the INVITE sent with `cseq`
    pub fn ack(&self, cseq: u32) -> SipRequest {
        let mut ack = SipRequest::new(
            Method::Ack,
            self.remote_target.clone(),
            self.call_id.clone(),
            cseq,
            self.local.clone(),
            self.remote.clone(),
        );
        ack.route = self.route_set.clone();
        ack
    }

    /// Learn remote tag, target and route set from a response (UAC)
    ///
    /// Route set and tag are only taken while the dialog is not yet
    /// confirmed; a 2xx confirms it.
    pub fn update_from_response(&mut self, response: &SipResponse) {
        if !self.confirmed {
            if let Some(tag) = &response.to.tag {
                self.remote.tag = Some(tag.clone());
            }
            self.route_set = response.record_route.iter().rev().cloned().collect();
        }
        if let Some(contact) = &response.contact {
            self.remote_target = contact_uri(contact);
        }
        if response.is_success() {
            self.confirmed = true;
        }
    }

    /// Target refresh from a re-INVITE/UPDATE or its response
    pub fn refresh_target(&mut self, contact: Option<&str>) {
        if let Some(contact) = contact {
            self.remote_target = contact_uri(contact);
        }
    }

    /// Validate and record the CSeq of an incoming in-dialog request
    ///
    /// ACK and CANCEL reuse the CSeq of the request they refer to and are
    /// not checked. Returns false for out-of-order requests.
    pub fn check_remote_cseq(&mut self, request: &SipRequest) -> bool {
        if matches!(request.method, Method::Ack | Method::Cancel) {
            return true;
        }
        match self.remote_cseq {
            Some(last) if request.cseq.seq <= last => false,
            _ => {
                self.remote_cseq = Some(request.cseq.seq);
                true
            }
        }
    }

    /// Whether an incoming request belongs to this dialog
    pub fn matches_request(&self, request: &SipRequest) -> bool {
        request.call_id == self.call_id
            && request.to.tag.as_deref() == self.local.tag.as_deref()
            && match (&self.remote.tag, &request.from.tag) {
                (Some(ours), Some(theirs)) => ours == theirs,
                (None, _) => true,
                (Some(_), None) => false,
            }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite() -> SipRequest {
        SipRequest::new(
            Method::Invite,
            "sip:bob@example.com",
            "dialog-call",
            10,
            NameAddr::new("sip:alice@example.com").with_tag("alice-tag"),
            NameAddr::new("sip:bob@example.com"),
        )
        .with_contact("<sip:alice@10.0.0.1>")
    }

    #[test]
    fn test_accept_from_invite() {
        let mut inv = invite();
        inv.record_route = vec!["<sip:p1;lr>".into(), "<sip:p2;lr>".into()];
        let dialog = Dialog::accept(&inv).unwrap();

        assert_eq!(dialog.call_id(), "dialog-call");
        assert_eq!(dialog.remote_tag(), Some("alice-tag"));
        assert_eq!(dialog.local_tag().len(), 8);
        assert_eq!(dialog.remote_target(), "sip:alice@10.0.0.1");
        assert_eq!(dialog.route_set(), inv.record_route.as_slice());
        assert!(!dialog.is_confirmed());
    }

    #[test]
    fn test_contact_uri() {
        assert_eq!(contact_uri("<sip:bob@10.0.0.2>"), "sip:bob@10.0.0.2");
        assert_eq!(contact_uri("\"Bob\" <sip:bob@host;transport=tcp>;expires=60"), "sip:bob@host;transport=tcp");
        assert_eq!(contact_uri(" sip:bob@host;expires=60"), "sip:bob@host");
    }

    #[test]
    fn test_retarget_forgets_early_dialog() {
        let mut dialog = Dialog::connect("sip:alice@example.com", "sip:bob@example.com", "sip:bob@example.com");
        let invite = dialog.request(Method::Invite);
        let mut ringing = SipResponse::for_request(&invite, 180, "Ringing").with_to_tag("bob-tag");
        ringing.record_route = vec!["<sip:p1;lr>".into()];
        dialog.update_from_response(&ringing);
        assert_eq!(dialog.remote_tag(), Some("bob-tag"));

        dialog.retarget("sip:bob@10.9.9.9");
        assert_eq!(dialog.remote_target(), "sip:bob@10.9.9.9");
        assert_eq!(dialog.remote_tag(), None);
        assert!(dialog.route_set().is_empty());
    }

    #[test]
    fn test_accept_requires_contact_and_tag() {
        let mut inv = invite();
        inv.contact = None;
        assert!(Dialog::accept(&inv).is_err());

        let mut inv = invite();
        inv.from.tag = None;
        assert!(Dialog::accept(&inv).is_err());

        let mut inv = invite();
        inv.to.tag = Some("x".into());
        assert!(Dialog::accept(&inv).is_err());
    }

    #[test]
    fn test_remote_cseq_ordering() {
        let mut dialog = Dialog::accept(&invite()).unwrap();
        let mut bye = invite();
        bye.method = Method::Bye;
        bye.cseq.seq = 10;
        assert!(!dialog.check_remote_cseq(&bye));
        bye.cseq.seq = 11;
        assert!(dialog.check_remote_cseq(&bye));

        let mut ack = invite();
        ack.method = Method::Ack;
        assert!(dialog.check_remote_cseq(&ack));
    }

    #[test]
    fn test_requests_consume_cseq() {
        let mut dialog = Dialog::connect("sip:alice@example.com", "sip:bob@example.com", "sip:bob@10.0.0.2");
        let first = dialog.request(Method::Invite);
        let second = dialog.request(Method::Bye);
        assert_eq!(second.cseq.seq, first.cseq.seq.wrapping_add(1));
        assert_eq!(dialog.ack(first.cseq.seq).cseq.seq, first.cseq.seq);
        assert_eq!(first.from.tag.as_deref(), Some(dialog.local_tag()));
    }

    #[test]
    fn test_update_from_response_reverses_route_set() {
        let mut dialog = Dialog::connect("sip:alice@example.com", "sip:bob@example.com", "sip:bob@10.0.0.2");
        let invite = dialog.request(Method::Invite);
        let mut ok = SipResponse::for_request(&invite, 200, "OK")
            .with_to_tag("bob-tag")
            .with_contact("<sip:bob@10.0.0.9>");
        ok.record_route = vec!["<sip:p1;lr>".into(), "<sip:p2;lr>".into()];

        dialog.update_from_response(&ok);
        assert!(dialog.is_confirmed());
        assert_eq!(dialog.remote_tag(), Some("bob-tag"));
        assert_eq!(dialog.remote_target(), "sip:bob@10.0.0.9");
        assert_eq!(dialog.route_set(), &["<sip:p2;lr>".to_string(), "<sip:p1;lr>".to_string()]);
    }
}
