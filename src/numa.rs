//! Thread and memory placement on NUMA nodes.
//!
//! Node discovery reads the Linux sysfs topology. When it is not available
//! (non-Linux, containers without `/sys`), `NoNuma` takes over and every
//! placement request becomes a no-op on the single domain 0.
use std::{fs, io, mem};

use thiserror::Error;

const NODE_ROOT: &str = "/sys/devices/system/node";

/// `MPOL_BIND` from `<linux/mempolicy.h>`.
#[cfg(target_os = "linux")]
const MPOL_BIND: libc::c_long = 2;

#[derive(Error, Debug)]
pub enum NumaError {
    #[error("failed to parse cpulist {0:?}: {1}")]
    Cpulist(String, String),
    #[error("NUMA node {node} out of range, {domains} domains available")]
    UnknownNode { node: usize, domains: usize },
    #[error("NUMA node {0} has no processors")]
    NoProcessors(usize),
    #[error("sched_setaffinity failed: {0}")]
    Affinity(io::Error),
    #[error("mbind failed: {0}")]
    Mbind(io::Error),
}

pub trait NumaPlacement: Send + Sync {
    /// Number of NUMA domains. Always at least one.
    fn domains(&self) -> usize;
    /// Restricts the calling thread to the processors of `node`.
    fn run_on_node(&self, node: usize) -> Result<(), NumaError>;
    /// Binds the pages backing `[addr, addr + len)` to `node`. Must be called
    /// before the memory is first touched.
    fn bind_memory(&self, addr: *mut u8, len: usize, node: usize) -> Result<(), NumaError>;
}

/// Passthrough placement for machines without NUMA support.
#[derive(Debug, Default)]
pub struct NoNuma;

impl NumaPlacement for NoNuma {
    fn domains(&self) -> usize {
        1
    }

    fn run_on_node(&self, _node: usize) -> Result<(), NumaError> {
        Ok(())
    }

    fn bind_memory(&self, _addr: *mut u8, _len: usize, _node: usize) -> Result<(), NumaError> {
        Ok(())
    }
}

/// Linux placement: `sched_setaffinity` for threads, `mbind` for memory.
#[derive(Debug)]
pub struct LinuxNuma {
    /// Node id and the processors belonging to it, indexed by domain.
    nodes: Vec<(u32, Vec<u32>)>,
}

impl LinuxNuma {
    /// Reads the node topology from sysfs. Returns `None` if sysfs does not
    /// describe any node with processors.
    pub fn discover() -> Option<Self> {
        let possible = fs::read_to_string(format!("{}/possible", NODE_ROOT)).ok()?;
        let node_ids = parse_cpulist(possible.trim()).ok()?;
        let nodes: Vec<_> = node_ids
            .into_iter()
            .filter_map(|node| {
                let cpulist = fs::read_to_string(format!("{}/node{}/cpulist", NODE_ROOT, node));
                let cpus = parse_cpulist(cpulist.ok()?.trim()).ok()?;
                // memory-only nodes cannot run threads
                (!cpus.is_empty()).then_some((node, cpus))
            })
            .collect();
        if nodes.is_empty() {
            return None;
        }
        Some(LinuxNuma { nodes })
    }

    pub fn from_nodes(nodes: Vec<(u32, Vec<u32>)>) -> Self {
        LinuxNuma { nodes }
    }

    fn node(&self, node: usize) -> Result<&(u32, Vec<u32>), NumaError> {
        self.nodes.get(node).ok_or(NumaError::UnknownNode {
            node,
            domains: self.nodes.len(),
        })
    }
}

impl NumaPlacement for LinuxNuma {
    fn domains(&self) -> usize {
        self.nodes.len()
    }

    fn run_on_node(&self, node: usize) -> Result<(), NumaError> {
        let (_, cpus) = self.node(node)?;
        if cpus.is_empty() {
            return Err(NumaError::NoProcessors(node));
        }
        set_affinity(cpus)
    }

    fn bind_memory(&self, addr: *mut u8, len: usize, node: usize) -> Result<(), NumaError> {
        let (node_id, _) = self.node(node)?;
        mbind(addr, len, *node_id)
    }
}

/// The best placement available on this machine.
pub fn detect() -> Box<dyn NumaPlacement> {
    match LinuxNuma::discover() {
        Some(numa) => {
            info!("Detected {} NUMA domain(s)", numa.domains());
            for (node, cpus) in &numa.nodes {
                debug!("node {}: cpus {}", node, cpulist::emit(cpus.iter().copied()));
            }
            Box::new(numa)
        }
        None => {
            info!("No NUMA topology found, placement requests are ignored");
            Box::new(NoNuma)
        }
    }
}

fn parse_cpulist(s: &str) -> Result<Vec<u32>, NumaError> {
    cpulist::parse(s).map_err(|e| NumaError::Cpulist(s.to_string(), e.to_string()))
}

#[cfg(target_os = "linux")]
fn set_affinity(cpus: &[u32]) -> Result<(), NumaError> {
    let (cpuset, usable) = cpu_set(cpus);
    if usable == 0 {
        return Err(NumaError::Affinity(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no processor id below {}", libc::CPU_SETSIZE),
        )));
    }
    // 0 means the calling thread
    let result = unsafe { libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &cpuset) };
    if result == 0 {
        Ok(())
    } else {
        Err(NumaError::Affinity(io::Error::last_os_error()))
    }
}

/// Affinity mask of `cpus` and the number of ids that fit into it. Ids at or
/// above `CPU_SETSIZE` cannot be expressed and are skipped.
#[cfg(target_os = "linux")]
fn cpu_set(cpus: &[u32]) -> (libc::cpu_set_t, usize) {
    // SAFETY: all zeroes is a valid cpu_set_t
    let mut cpuset: libc::cpu_set_t = unsafe { mem::zeroed() };
    let mut usable = 0;
    for &cpu in cpus {
        if cpu as usize >= libc::CPU_SETSIZE as usize {
            debug!("cpu {} does not fit an affinity mask, skipped", cpu);
            continue;
        }
        unsafe { libc::CPU_SET(cpu as usize, &mut cpuset) };
        usable += 1;
    }
    (cpuset, usable)
}

#[cfg(not(target_os = "linux"))]
fn set_affinity(_cpus: &[u32]) -> Result<(), NumaError> {
    Ok(())
}

#[cfg(target_os = "linux")]
fn mbind(addr: *mut u8, len: usize, node_id: u32) -> Result<(), NumaError> {
    const BITS: usize = u64::BITS as usize;
    let mut mask = vec![0u64; node_id as usize / BITS + 1];
    mask[node_id as usize / BITS] |= 1 << (node_id as usize % BITS);
    let maxnode = mask.len() * BITS + 1;
    let result = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            addr as *mut libc::c_void,
            len as libc::c_ulong,
            MPOL_BIND,
            mask.as_ptr(),
            maxnode as libc::c_ulong,
            0 as libc::c_uint,
        )
    };
    if result == 0 {
        Ok(())
    } else {
        Err(NumaError::Mbind(io::Error::last_os_error()))
    }
}

#[cfg(not(target_os = "linux"))]
fn mbind(_addr: *mut u8, _len: usize, _node_id: u32) -> Result<(), NumaError> {
    Ok(())
}
