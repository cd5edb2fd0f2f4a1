//! Shared test doubles.

use crate::instance::Connection;
use crate::pool::PoolBuf;
use crate::ClaError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// In-memory [`Connection`]: records submissions, completes buffers
/// immediately, and can be told to fail.
pub(crate) struct MockConnection {
    pub peer: String,
    pub initiator: bool,
    pub mtu: usize,
    pub submitted: Mutex<Vec<Vec<u8>>>,
    pub fail_submit: AtomicBool,
    pub closed: AtomicBool,
    pub channel_requests: AtomicUsize,
}

impl MockConnection {
    pub fn new(peer: &str, initiator: bool) -> Arc<Self> {
        Arc::new(Self {
            peer: peer.to_string(),
            initiator,
            mtu: 32,
            submitted: Mutex::new(Vec::new()),
            fail_submit: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            channel_requests: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn peer_identifier(&self) -> String {
        self.peer.clone()
    }

    fn is_initiator(&self) -> bool {
        self.initiator
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn request_channel(&self) -> Result<(), ClaError> {
        self.channel_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn submit(&self, buf: PoolBuf) -> Result<(), ClaError> {
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(ClaError::Disconnected);
        }
        self.submitted.lock().unwrap().push(buf.data.to_vec());
        buf.complete();
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
