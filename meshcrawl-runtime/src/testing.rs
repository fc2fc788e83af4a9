//! In-memory transport and rotator used by the runtime tests

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

use meshcrawl_net::{FetchedResource, IdentityRotator, Transport, TransportError};

#[derive(Debug, Clone)]
enum Reply {
    Body(Vec<u8>),
    Status(u16),
    Delayed(Duration, Vec<u8>),
    Hang,
    Panic,
}

/// Serves canned replies per URL; the last reply for a URL repeats
#[derive(Default)]
pub struct MockTransport {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    requests: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, url: &str, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn page(&self, url: &str, body: &str) {
        self.push(url, Reply::Body(body.as_bytes().to_vec()));
    }

    pub fn bytes(&self, url: &str, body: &[u8]) {
        self.push(url, Reply::Body(body.to_vec()));
    }

    pub fn status(&self, url: &str, status: u16) {
        self.push(url, Reply::Status(status));
    }

    /// Answer with `body` after `delay`
    pub fn page_after(&self, url: &str, delay: Duration, body: &str) {
        self.push(url, Reply::Delayed(delay, body.as_bytes().to_vec()));
    }

    /// Panic while serving this URL
    pub fn panic_on(&self, url: &str) {
        self.push(url, Reply::Panic);
    }

    /// Never answer this URL
    pub fn hang(&self, url: &str) {
        self.push(url, Reply::Hang);
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self, url: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.as_str() == url)
            .count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn get(&self, url: &Url) -> Result<FetchedResource, TransportError> {
        self.requests.lock().unwrap().push(url.to_string());

        let reply = {
            let mut replies = self.replies.lock().unwrap();
            match replies.get_mut(url.as_str()) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        let reply = match reply {
            Some(Reply::Delayed(delay, body)) => {
                tokio::time::sleep(delay).await;
                Some(Reply::Body(body))
            }
            other => other,
        };

        match reply {
            Some(Reply::Body(body)) => Ok(FetchedResource {
                url: url.clone(),
                status: 200,
                headers: vec![("content-type".to_string(), "text/html".to_string())],
                body,
            }),
            Some(Reply::Status(status)) => Err(TransportError::Status {
                url: url.to_string(),
                status,
            }),
            Some(Reply::Hang) => std::future::pending().await,
            Some(Reply::Panic) => panic!("transport blew up on {}", url),
            Some(Reply::Delayed(..)) => unreachable!(),
            None => Err(TransportError::Status {
                url: url.to_string(),
                status: 404,
            }),
        }
    }
}

/// Rotator that records calls and never touches the network
pub struct MockRotator {
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    succeed: AtomicBool,
    enumerates: bool,
    cursor: AtomicUsize,
}

impl MockRotator {
    pub fn new() -> Self {
        Self {
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            succeed: AtomicBool::new(true),
            enumerates: true,
            cursor: AtomicUsize::new(0),
        }
    }

    /// A backend that cannot list locations
    pub fn without_locations() -> Self {
        Self {
            enumerates: false,
            ..Self::new()
        }
    }

    pub fn set_succeed(&self, succeed: bool) {
        self.succeed.store(succeed, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityRotator for MockRotator {
    fn name(&self) -> &str {
        "Mock"
    }

    async fn connect(&self, _location: &str) -> bool {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.succeed.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> bool {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        true
    }

    async fn status(&self) -> String {
        "Mock - connected".to_string()
    }

    fn next_location(&self) -> Option<String> {
        if !self.enumerates {
            return None;
        }
        let n = self.cursor.fetch_add(1, Ordering::SeqCst);
        Some(format!("loc-{}", n))
    }
}
