use std::{net::{Ipv4Addr, SocketAddr, ToSocketAddrs}, time::{Duration, Instant}};
use bytes::{Buf, BufMut, BytesMut};
use tokio::{net::UdpSocket, time};
use url::Url;
use super::{AnnounceParams, Backoff, Event, Result, Tracker, TrackerError, DEFAULT_MIN_ANNOUNCE_INTERVAL, clamp_reannounce_interval};

// Reference: https://www.bittorrent.org/beps/bep_0015.html

const PROTOCOL_ID: i64      = 0x41727101980;
const ACTION_CONNECT: i32   = 0;
const ACTION_ANNOUNCE: i32  = 1;
const ACTION_SCRAPE: i32    = 2;

/// Result of a BEP 15 scrape request for a single info-hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeInfo {
    pub seeders: i32,
    pub completed: i32,
    pub leechers: i32,
}

pub struct UdpTracker {

    socket: UdpSocket,

    url: Url,

    conn_id: Option<i64>,

    last_announce: Option<Instant>,

    interval: Option<Duration>,

}

impl UdpTracker {

    pub async fn new(url: Url) -> Self {
        // Uses first available local port.
        let socket = UdpSocket::bind("0.0.0.0:0").await.unwrap();
        Self {
            socket,
            url,
            conn_id: None,
            last_announce: None,
            interval: None,
        }
    }

    /// Connects, retrying on timeout per BEP 15's schedule (`15 * 2^n`
    /// seconds, giving up after the backoff is exhausted).
    async fn connect(&mut self) -> Result<()> {
        let mut backoff = Backoff::new();
        loop {
            match self.connect_once().await {
                Ok(()) => return Ok(()),
                Err(e) if backoff.exhausted() => return Err(e),
                Err(e) => {
                    tracing::debug!("udp connect failed, retrying: {}", e);
                    tokio::time::sleep(backoff.next_delay()).await;
                }
            }
        }
    }

    async fn connect_once(&mut self) -> Result<()> {

        let host = self.url.host_str().ok_or(TrackerError::InvalidUrl)?;
        let port = self.url.port().ok_or(TrackerError::InvalidUrl)?;
        let addr = (host, port).to_socket_addrs()?.next().ok_or(TrackerError::InvalidUrl)?;
        let timeout_duration = Duration::from_secs(10);
        time::timeout(timeout_duration, self.socket.connect(addr)).await??;

        // Send connect request.
        let trans_id = rand::random();

        let mut buf = BytesMut::with_capacity(16);
        buf.put_i64(PROTOCOL_ID);
        buf.put_i32(ACTION_CONNECT);
        buf.put_i32(trans_id);

        self.socket.send(&buf).await?;

        // Receive connect response.
        let mut resp_buf = [0u8; 16];
        let n = time::timeout(timeout_duration, self.socket.recv(&mut resp_buf)).await??;
        if n < 16 {
            return Err(TrackerError::ResponseError("invalid response length".to_string()));
        }
        let mut resp = &resp_buf[..];
        if resp.get_i32() != ACTION_CONNECT {
            return Err(TrackerError::ResponseError("expected action 0".to_string()));
        }
        if resp.get_i32() != trans_id {
            return Err(TrackerError::ResponseError("invalid transaction id".to_string()));
        }
        self.conn_id = Some(resp.get_i64());

        tracing::trace!("connected to tracker");
        Ok(())
    }

    /// BEP 15 scrape: returns seeder/completed/leecher counts for a single
    /// info-hash without performing a full announce.
    pub async fn scrape(&mut self, info_hash: crate::ID) -> Result<ScrapeInfo> {
        self.connect().await?;

        let trans_id = rand::random();
        let mut buf = BytesMut::with_capacity(16 + 20);
        buf.put_i64(self.conn_id.unwrap());
        buf.put_i32(ACTION_SCRAPE);
        buf.put_i32(trans_id);
        buf.put(&info_hash[..]);

        self.socket.send(&buf).await?;

        let mut resp_buf = [0u8; 20];
        let n = self.socket.recv(&mut resp_buf).await?;
        if n < 20 {
            return Err(TrackerError::ResponseError("invalid response length".to_string()));
        }
        let mut resp = &resp_buf[..];
        if resp.get_i32() != ACTION_SCRAPE {
            return Err(TrackerError::ResponseError("expected action 2".to_string()));
        }
        if resp.get_i32() != trans_id {
            return Err(TrackerError::ResponseError("invalid transaction id".to_string()));
        }

        Ok(ScrapeInfo {
            seeders: resp.get_i32(),
            completed: resp.get_i32(),
            leechers: resp.get_i32(),
        })
    }
}

#[async_trait::async_trait]
impl Tracker for UdpTracker {

    async fn announce(&mut self, params: AnnounceParams) -> Result<Vec<SocketAddr>> {
        
        self.connect().await?;

        let trans_id = rand::random();

        let mut buf = BytesMut::with_capacity(98);
        buf.put_i64(self.conn_id.unwrap());
        buf.put_i32(ACTION_ANNOUNCE);
        buf.put_i32(trans_id);
        buf.put(&params.info_hash[..]);
        buf.put(&params.client_id[..]);
        buf.put_u64(params.downloaded);
        buf.put_u64(params.left);
        buf.put_u64(params.uploaded);
        buf.put_i32(
            match params.event {
                Some(Event::Started) => 2,
                Some(Event::Completed) => 1,
                Some(Event::Stopped) => 3,
                None => 0,
            }
        );
        buf.put_i32(0); // IP address, default = 0.
        buf.put_i32(rand::random()); // Key, random.
        buf.put_i32(
            match params.num_want {
                Some(num_want) => num_want as i32,
                None => -1,
            }
        );
        buf.put_u16(params.port);

        self.socket.send(&buf).await?;

        let mut resp_buf = [0u8; 1024];
        let n = self.socket.recv(&mut resp_buf).await?;
        let mut resp = &resp_buf[..];
        if n < 20 {
            return Err(TrackerError::ResponseError("invalid response length".to_string()));
        }
        if resp.get_i32() != ACTION_ANNOUNCE {
            return Err(TrackerError::ResponseError("expected action 1".to_string()));
        }
        if resp.get_i32() != trans_id {
            return Err(TrackerError::ResponseError("invalid transaction id".to_string()));
        }
        let interval = resp.get_i32();
        let _leechers = resp.get_i32();
        let _seeders = resp.get_i32();
        if interval > 0 {
            self.interval = Some(clamp_reannounce_interval(interval as u64));
        }
        let num_peers = (n - 20) / 6;

        let mut peers = Vec::with_capacity(num_peers);
        for _ in 0..num_peers {
            let ip = resp.get_u32();
            let port = resp.get_u16();
            peers.push(SocketAddr::new(Ipv4Addr::from(ip).into(), port));
        }

        tracing::info!("provided {} peers", peers.len());
        self.last_announce = Some(Instant::now());
        Ok(peers)
    }

    fn can_announce(&self, time: Instant) -> bool {
        
        if let Some(last_announce) = self.last_announce {
            time.duration_since(last_announce) 
            >= self.interval.unwrap_or(Duration::from_secs(DEFAULT_MIN_ANNOUNCE_INTERVAL))
        
        } else {
            true
        }
    }

    fn should_announce(&self, time: Instant) -> bool { self.can_announce(time) }
}
