use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::TcpListener;
use std::ops::Range;
use std::str::FromStr;
use tracing::debug;

use super::runtime::ContainerRuntime;
use crate::error::{OrchestratorError, Result};
use crate::models::WorkspaceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortPolicy {
    /// `base_port + workspace_id`, skipping ports other containers publish.
    Deterministic,
    /// First port in range that a test socket can bind.
    Scan,
}

impl FromStr for PortPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "deterministic" => Ok(PortPolicy::Deterministic),
            "scan" => Ok(PortPolicy::Scan),
            _ => Err(format!("Unknown port policy: {}. Valid options: deterministic, scan", s)),
        }
    }
}

pub struct PortAllocator {
    range: Range<u16>,
    policy: PortPolicy,
}

impl PortAllocator {
    pub fn new(range: Range<u16>, policy: PortPolicy) -> Self {
        Self { range, policy }
    }

    fn no_free_port(&self) -> OrchestratorError {
        OrchestratorError::NoFreePort {
            start: self.range.start,
            end: self.range.end,
        }
    }

    /// Ports published by every container the runtime knows about.
    pub async fn published_ports(&self, runtime: &dyn ContainerRuntime) -> Result<HashSet<u16>> {
        let containers = runtime.list_containers().await?;
        Ok(containers
            .into_iter()
            .flat_map(|c| c.published_ports)
            .collect())
    }

    /// Picks a port for `workspace_id`.
    ///
    /// `preferred` (the port a previous container held) wins when it is still
    /// free. `excluded` holds ports that must not be returned: published by
    /// other containers, or rejected by the runtime on an earlier attempt.
    pub fn allocate(
        &self,
        workspace_id: WorkspaceId,
        preferred: Option<u16>,
        excluded: &HashSet<u16>,
    ) -> Result<u16> {
        if let Some(port) = preferred {
            if self.range.contains(&port) && !excluded.contains(&port) {
                return Ok(port);
            }
        }

        match self.policy {
            PortPolicy::Deterministic => self.deterministic(workspace_id, excluded),
            PortPolicy::Scan => self.scan_with(|port| !excluded.contains(&port) && probe(port)),
        }
    }

    /// `base_port + workspace_id`, incremented past any port in `taken`.
    pub fn deterministic(&self, workspace_id: WorkspaceId, taken: &HashSet<u16>) -> Result<u16> {
        let start = u32::from(self.range.start)
            .checked_add(workspace_id)
            .filter(|&port| port < u32::from(self.range.end))
            .and_then(|port| u16::try_from(port).ok())
            .ok_or_else(|| self.no_free_port())?;

        (start..self.range.end)
            .find(|port| !taken.contains(port))
            .ok_or_else(|| self.no_free_port())
    }

    /// First port in range a test socket can bind. The socket is released
    /// immediately, so the port may be taken again before the container binds it.
    pub fn scan(&self) -> Result<u16> {
        self.scan_with(probe)
    }

    pub fn scan_with(&self, mut is_free: impl FnMut(u16) -> bool) -> Result<u16> {
        self.range
            .clone()
            .find(|&port| is_free(port))
            .ok_or_else(|| self.no_free_port())
    }
}

fn probe(port: u16) -> bool {
    match TcpListener::bind(("0.0.0.0", port)) {
        Ok(_) => true,
        Err(e) => {
            debug!("Port {} unavailable: {}", port, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::fake::FakeRuntime;

    #[test]
    fn scan_skips_occupied_ports() {
        let allocator = PortAllocator::new(8000..8010, PortPolicy::Scan);
        let occupied: HashSet<u16> = (8000..=8004).collect();
        assert_eq!(allocator.scan_with(|p| !occupied.contains(&p)).unwrap(), 8005);
    }

    #[test]
    fn scan_fails_when_range_exhausted() {
        let allocator = PortAllocator::new(8000..8010, PortPolicy::Scan);
        let err = allocator.scan_with(|_| false).unwrap_err();
        assert!(matches!(err, OrchestratorError::NoFreePort { start: 8000, end: 8010 }));
    }

    #[test]
    fn scan_probe_skips_a_bound_socket() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let allocator = PortAllocator::new(port..port + 1, PortPolicy::Scan);
        assert!(allocator.scan().is_err());
    }

    #[test]
    fn deterministic_port_follows_workspace_id() {
        let allocator = PortAllocator::new(8000..10000, PortPolicy::Deterministic);
        assert_eq!(allocator.deterministic(12, &HashSet::new()).unwrap(), 8012);

        let taken: HashSet<u16> = [8012, 8013].into_iter().collect();
        assert_eq!(allocator.deterministic(12, &taken).unwrap(), 8014);

        assert!(allocator.deterministic(5000, &HashSet::new()).is_err());
    }

    #[test]
    fn deterministic_port_rejects_ids_past_the_range() {
        let allocator = PortAllocator::new(8000..10000, PortPolicy::Deterministic);
        let err = allocator.deterministic(u32::MAX, &HashSet::new()).unwrap_err();
        assert!(matches!(err, OrchestratorError::NoFreePort { start: 8000, end: 10000 }));

        let err = allocator.allocate(u32::MAX - 7000, None, &HashSet::new()).unwrap_err();
        assert!(matches!(err, OrchestratorError::NoFreePort { .. }));
    }

    #[test]
    fn preferred_port_is_reused_when_free() {
        let allocator = PortAllocator::new(8000..10000, PortPolicy::Deterministic);
        assert_eq!(allocator.allocate(3, Some(8100), &HashSet::new()).unwrap(), 8100);

        let taken: HashSet<u16> = [8100].into_iter().collect();
        assert_eq!(allocator.allocate(3, Some(8100), &taken).unwrap(), 8003);
    }

    #[tokio::test]
    async fn published_ports_come_from_all_containers() {
        let runtime = FakeRuntime::new();
        runtime.insert_container("workspace_1", 8001, true);
        runtime.insert_container("workspace_2", 8002, false);

        let allocator = PortAllocator::new(8000..10000, PortPolicy::Deterministic);
        let ports = allocator.published_ports(&runtime).await.unwrap();
        assert_eq!(ports, [8001, 8002].into_iter().collect());
        assert_eq!(allocator.deterministic(1, &ports).unwrap(), 8003);
    }
}
