//! Kernel object events
//!
//! Listens on a `NETLINK_KOBJECT_UEVENT` socket and turns block-device
//! add/change/remove messages into [`DeviceEvent`]s. Both raw kernel
//! messages (`action@devpath\0KEY=VALUE\0...`) and libudev-framed ones are
//! decoded.

use super::device::DeviceFact;
use super::scanner::DeviceScanner;
use crate::error::{Error, Result};
use crate::hardware::registry::DeviceEvent;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use nix::sys::socket::{
    bind, recv, socket, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::os::fd::{AsRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;
use tracing::{debug, error, warn};

// =============================================================================
// Constants
// =============================================================================

const LIBUDEV_PREFIX: &[u8; 8] = b"libudev\0";
const LIBUDEV_MAGIC: u32 = 0xfeed_cafe;
/// Smallest libudev header that still carries `properties_off`
const LIBUDEV_MIN_HEADER: usize = 20;

/// Multicast group libudev re-broadcasts processed events on
pub const UDEV_MONITOR_GROUP: u32 = 2;

/// Consecutive undecodable messages tolerated before the stream fails
pub const DEFAULT_MAX_DECODE_ERRORS: usize = 10;

const RECV_BUFFER: usize = 64 * 1024;

// =============================================================================
// Messages
// =============================================================================

/// Action of a uevent the engine cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UeventAction {
    Add,
    Change,
    Remove,
}

impl UeventAction {
    fn parse(action: &str) -> Option<Self> {
        match action {
            "add" => Some(UeventAction::Add),
            "change" => Some(UeventAction::Change),
            "remove" => Some(UeventAction::Remove),
            _ => None,
        }
    }
}

/// A decoded uevent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UeventMessage {
    pub action: String,
    pub devpath: String,
    pub properties: BTreeMap<String, String>,
}

impl UeventMessage {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn seqnum(&self) -> u64 {
        self.get("SEQNUM").and_then(|s| s.parse().ok()).unwrap_or(0)
    }

    /// Block-subsystem add/change/remove, else `None`
    pub fn block_action(&self) -> Option<UeventAction> {
        if self.get("SUBSYSTEM") != Some("block") {
            return None;
        }
        UeventAction::parse(&self.action)
    }

    /// Bare facts for a device that is gone from sysfs
    fn removed_fact(&self) -> DeviceFact {
        let devname = self.get("DEVNAME").unwrap_or_default();
        let name = devname.rsplit('/').next().unwrap_or(devname).to_string();
        DeviceFact {
            name,
            devpath: self.devpath.clone(),
            major: self.get("MAJOR").and_then(|s| s.parse().ok()).unwrap_or(0),
            minor: self.get("MINOR").and_then(|s| s.parse().ok()).unwrap_or(0),
            partition_num: self.get("PARTN").and_then(|s| s.parse().ok()).unwrap_or(0),
            ..Default::default()
        }
    }
}

fn parse_properties(payload: &[u8]) -> BTreeMap<String, String> {
    payload
        .split(|b| *b == 0)
        .filter(|f| !f.is_empty())
        .filter_map(|f| {
            let field = String::from_utf8_lossy(f);
            let (k, v) = field.split_once('=')?;
            Some((k.to_string(), v.to_string()))
        })
        .collect()
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidArgument(format!("uevent: {}", reason.into()))
}

/// Decode one netlink datagram
pub fn decode(buf: &[u8]) -> Result<UeventMessage> {
    if buf.starts_with(LIBUDEV_PREFIX) {
        return decode_libudev(buf);
    }

    let header_end = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| invalid("missing header terminator"))?;
    let header = String::from_utf8_lossy(&buf[..header_end]);
    let (action, devpath) = header
        .split_once('@')
        .ok_or_else(|| invalid(format!("malformed header {header:?}")))?;

    let properties = parse_properties(&buf[header_end + 1..]);
    Ok(UeventMessage {
        action: properties
            .get("ACTION")
            .cloned()
            .unwrap_or_else(|| action.to_string()),
        devpath: properties
            .get("DEVPATH")
            .cloned()
            .unwrap_or_else(|| devpath.to_string()),
        properties,
    })
}

fn decode_libudev(buf: &[u8]) -> Result<UeventMessage> {
    if buf.len() < LIBUDEV_MIN_HEADER {
        return Err(invalid("short libudev header"));
    }
    let magic = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
    if magic != LIBUDEV_MAGIC {
        return Err(invalid(format!("bad libudev magic {magic:#x}")));
    }

    let offset = u32::from_ne_bytes([buf[16], buf[17], buf[18], buf[19]]) as usize;
    if offset <= 16 || offset >= buf.len() {
        return Err(invalid(format!("libudev payload offset {offset}")));
    }

    let properties = parse_properties(&buf[offset..]);
    let action = properties
        .get("ACTION")
        .cloned()
        .ok_or_else(|| invalid("libudev message without ACTION"))?;
    let devpath = properties
        .get("DEVPATH")
        .cloned()
        .ok_or_else(|| invalid("libudev message without DEVPATH"))?;
    Ok(UeventMessage {
        action,
        devpath,
        properties,
    })
}

// =============================================================================
// Ordering
// =============================================================================

/// Drops events whose SEQNUM is not newer than the last one seen per device
#[derive(Debug, Default)]
pub struct SeqTracker {
    last: HashMap<String, u64>,
}

impl SeqTracker {
    /// Whether `msg` is fresh; records it when it is
    pub fn accept(&mut self, msg: &UeventMessage) -> bool {
        let seq = msg.seqnum();
        if seq == 0 {
            return true;
        }
        match self.last.get(&msg.devpath) {
            Some(last) if *last >= seq => false,
            _ => {
                self.last.insert(msg.devpath.clone(), seq);
                true
            }
        }
    }
}

// =============================================================================
// Netlink Socket
// =============================================================================

/// Non-blocking uevent socket registered with the tokio reactor
pub struct UeventSocket {
    fd: AsyncFd<OwnedFd>,
}

impl UeventSocket {
    /// Open and bind to `group`
    pub fn open(group: u32) -> Result<Self> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            SockProtocol::NetlinkKObjectUEvent,
        )
        .map_err(|e| Error::sys("socket", e))?;
        bind(fd.as_raw_fd(), &NetlinkAddr::new(0, group)).map_err(|e| Error::sys("bind", e))?;
        Ok(Self {
            fd: AsyncFd::new(fd)?,
        })
    }

    /// Receive one datagram
    pub async fn recv(&self) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; RECV_BUFFER];
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                recv(inner.as_raw_fd(), &mut buf, MsgFlags::empty()).map_err(std::io::Error::from)
            }) {
                Ok(Ok(n)) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }

    /// Endless stream of raw datagrams
    pub fn into_stream(self) -> BoxStream<'static, std::io::Result<Vec<u8>>> {
        stream::unfold(self, |sock| async move {
            let msg = sock.recv().await;
            Some((msg, sock))
        })
        .boxed()
    }
}

// =============================================================================
// Device Event Stream
// =============================================================================

struct WatchState<S> {
    source: S,
    scanner: DeviceScanner,
    tracker: SeqTracker,
    pending: VecDeque<DeviceEvent>,
    errors: usize,
    max_errors: usize,
    failed: bool,
}

impl<S> WatchState<S> {
    /// Translate one accepted message into events
    fn translate(&mut self, msg: &UeventMessage, action: UeventAction) {
        if action == UeventAction::Remove {
            let fact = msg.removed_fact();
            if self.scanner.admits(&fact.name) {
                self.pending.push_back(DeviceEvent::Removed(fact));
            }
            return;
        }

        match self.scanner.probe_devpath(&msg.devpath) {
            Ok(facts) => {
                let admitted: Vec<DeviceFact> = facts
                    .into_iter()
                    .filter(|f| self.scanner.admits(&f.name))
                    .collect();
                for fact in admitted {
                    let event = if action == UeventAction::Add {
                        DeviceEvent::Added(fact)
                    } else {
                        DeviceEvent::Changed(fact)
                    };
                    self.pending.push_back(event);
                }
            }
            Err(e) => warn!(devpath = %msg.devpath, error = %e, "unable to probe device"),
        }
    }
}

/// Turn raw uevent datagrams into device events.
///
/// Each undecodable datagram counts against `max_errors`; a decodable one
/// resets the count. When the budget is exhausted the stream yields one
/// `Fatal` error and ends.
pub fn device_events<S>(
    source: S,
    scanner: DeviceScanner,
    max_errors: usize,
) -> impl Stream<Item = Result<DeviceEvent>>
where
    S: Stream<Item = std::io::Result<Vec<u8>>> + Unpin,
{
    let state = WatchState {
        source,
        scanner,
        tracker: SeqTracker::default(),
        pending: VecDeque::new(),
        errors: 0,
        max_errors,
        failed: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                return Some((Ok(event), st));
            }
            if st.failed {
                return None;
            }

            let raw = match st.source.next().await? {
                Ok(raw) => decode(&raw),
                Err(e) => Err(Error::Io(e)),
            };

            match raw {
                Ok(msg) => {
                    st.errors = 0;
                    let Some(action) = msg.block_action() else {
                        continue;
                    };
                    if !st.tracker.accept(&msg) {
                        debug!(devpath = %msg.devpath, seq = msg.seqnum(), "dropping stale uevent");
                        continue;
                    }
                    st.translate(&msg, action);
                }
                Err(e) => {
                    st.errors += 1;
                    warn!(error = %e, attempt = st.errors, "uevent decode failed");
                    if st.errors >= st.max_errors {
                        error!(errors = st.errors, "giving up on uevent stream");
                        st.failed = true;
                        return Some((
                            Err(Error::Fatal(format!(
                                "uevent stream failed {} times in a row: {e}",
                                st.errors
                            ))),
                            st,
                        ));
                    }
                }
            }
        }
    })
}

/// Open the udev monitor socket and stream device events from it
pub fn watch(scanner: DeviceScanner) -> Result<BoxStream<'static, Result<DeviceEvent>>> {
    let socket = UeventSocket::open(UDEV_MONITOR_GROUP)?;
    Ok(device_events(socket.into_stream(), scanner, DEFAULT_MAX_DECODE_ERRORS).boxed())
}
