use std::fs;
use std::num::NonZeroUsize;
use std::path::Path;

use lru::LruCache;
use parking_lot::Mutex;

use splittun_net::Proto;

const EXE_CACHE_SIZE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExeInfo {
    /// Lowercased full executable path.
    pub exe: String,
    /// Lowercased base name.
    pub base: String,
}

impl ExeInfo {
    pub fn from_path(path: &str) -> Self {
        let exe = path.to_lowercase();
        let base = exe
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(exe.as_str())
            .to_string();
        Self { exe, base }
    }
}

/// Host connection-table and executable lookup.
pub trait ProcessIndex: Send + Sync {
    /// Owning PID of a local socket, by transport and local source port.
    fn owner_pid(&self, proto: Proto, src_port: u16) -> Option<u32>;
    /// Lowered exe path and base name for a PID.
    fn exe_of(&self, pid: u32) -> Option<ExeInfo>;
}

/// `/proc`-backed index with an LRU cache over exe resolution.
pub struct ProcfsIndex {
    exe_cache: Mutex<LruCache<u32, ExeInfo>>,
}

impl Default for ProcfsIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcfsIndex {
    pub fn new() -> Self {
        Self {
            exe_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(EXE_CACHE_SIZE).unwrap(),
            )),
        }
    }
}

impl ProcessIndex for ProcfsIndex {
    fn owner_pid(&self, proto: Proto, src_port: u16) -> Option<u32> {
        let table = match proto {
            Proto::Tcp => "/proc/net/tcp",
            Proto::Udp => "/proc/net/udp",
            Proto::Icmp => return None,
        };
        let contents = fs::read_to_string(table).ok()?;
        let inode = socket_inode(&contents, src_port)?;
        pid_of_inode(inode)
    }

    fn exe_of(&self, pid: u32) -> Option<ExeInfo> {
        if let Some(hit) = self.exe_cache.lock().get(&pid) {
            return Some(hit.clone());
        }
        let link = fs::read_link(format!("/proc/{pid}/exe")).ok()?;
        let info = ExeInfo::from_path(&link.to_string_lossy());
        self.exe_cache.lock().put(pid, info.clone());
        Some(info)
    }
}

/// Scan a `/proc/net/tcp`-format table for the inode of a socket bound to
/// `port`.
fn socket_inode(table: &str, port: u16) -> Option<u64> {
    for line in table.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let _sl = fields.next()?;
        let local = fields.next()?;
        let (_, port_hex) = local.split_once(':')?;
        if u16::from_str_radix(port_hex, 16).ok()? != port {
            continue;
        }
        // sl local rem st tx_rx tr_tm retrnsmt uid timeout inode
        let inode = fields.nth(6)?;
        return inode.parse().ok();
    }
    None
}

fn pid_of_inode(inode: u64) -> Option<u32> {
    let needle = format!("socket:[{inode}]");
    let proc_dir = fs::read_dir("/proc").ok()?;
    for entry in proc_dir.flatten() {
        let name = entry.file_name();
        let Ok(pid) = name.to_string_lossy().parse::<u32>() else {
            continue;
        };
        let fd_dir = Path::new("/proc").join(name).join("fd");
        let Ok(fds) = fs::read_dir(fd_dir) else {
            continue;
        };
        for fd in fds.flatten() {
            if let Ok(target) = fs::read_link(fd.path())
                && target.to_string_lossy() == needle
            {
                return Some(pid);
            }
        }
    }
    None
}
