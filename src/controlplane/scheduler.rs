//! Drive Scheduler
//!
//! Picks the drive a new volume lands on and reserves capacity for it. A
//! drive holds one `directpv.min.io.volume/<name>` finalizer per bound
//! volume, which also makes scheduling idempotent: a volume whose finalizer
//! is already on a drive gets that drive back.

use crate::crd::{condition, volume_finalizer, AccessTier, Drive, DrivePhase};
use crate::csi::{Topology, TopologyRequirement};
use crate::domain::ports::DriveStoreRef;
use crate::error::{Error, Result};
use crate::labels::{LabelKey, LabelSelector};
use crate::store::retry_on_conflict;
use kube::ResourceExt;
use rand::Rng;
use tracing::{debug, info};

/// Selections retried when the chosen drive changes underneath
const SCHEDULE_ATTEMPTS: usize = 5;

/// What a new volume needs from its drive
#[derive(Debug, Clone, Default)]
pub struct Placement {
    pub volume: String,
    pub required_bytes: u64,
    /// Requested filesystem; empty means xfs
    pub filesystem: String,
    pub access_tier: Option<AccessTier>,
    pub topology: Option<TopologyRequirement>,
}

impl Placement {
    fn has_topology(&self) -> bool {
        self.topology
            .as_ref()
            .is_some_and(|t| !t.preferred.is_empty() || !t.requisite.is_empty())
    }

    fn filesystem(&self) -> &str {
        if self.filesystem.is_empty() {
            "xfs"
        } else {
            &self.filesystem
        }
    }
}

/// A topology term matches when every segment equals the drive's value
fn term_matches(drive: &Drive, term: &Topology) -> bool {
    let topology = drive.status.as_ref().map(|s| &s.topology);
    term.segments
        .iter()
        .all(|(k, v)| topology.and_then(|t| t.get(k)) == Some(v))
}

fn topology_matches(drive: &Drive, requirement: Option<&TopologyRequirement>) -> bool {
    let Some(req) = requirement else {
        return true;
    };
    if req.preferred.iter().any(|t| term_matches(drive, t)) {
        return true;
    }
    if req.requisite.iter().any(|t| term_matches(drive, t)) {
        return true;
    }
    req.preferred.is_empty() && req.requisite.is_empty()
}

/// Whether `drive` can host the volume described by `placement`
pub fn drive_matches(drive: &Drive, placement: &Placement) -> bool {
    let Some(status) = drive.status.as_ref() else {
        return false;
    };
    if drive.is_terminating() || !status.condition_true(condition::READY) {
        return false;
    }
    if !matches!(status.drive_status, DrivePhase::Ready | DrivePhase::InUse) {
        return false;
    }
    if status.free_capacity < placement.required_bytes {
        return false;
    }
    if status.filesystem != placement.filesystem() {
        return false;
    }
    if placement.access_tier.is_some_and(|tier| status.access_tier != tier) {
        return false;
    }
    topology_matches(drive, placement.topology.as_ref())
}

/// Choose among matching drives: most free capacity, ties broken uniformly
pub fn select_drive<'a, R: Rng + ?Sized>(
    drives: &'a [Drive],
    placement: &Placement,
    rng: &mut R,
) -> Result<&'a Drive> {
    let candidates: Vec<&Drive> = drives
        .iter()
        .filter(|d| drive_matches(d, placement))
        .collect();

    let free = |d: &Drive| d.status.as_ref().map_or(0, |s| s.free_capacity);
    let Some(max_free) = candidates.iter().map(|d| free(d)).max() else {
        return Err(no_drive_error(placement));
    };
    let best: Vec<&Drive> = candidates
        .into_iter()
        .filter(|d| free(d) == max_free)
        .collect();

    let pick = if best.len() == 1 {
        0
    } else {
        rng.random_range(0..best.len())
    };
    Ok(best[pick])
}

fn no_drive_error(placement: &Placement) -> Error {
    if placement.has_topology() {
        let nodes: Vec<&str> = placement
            .topology
            .iter()
            .flat_map(|t| t.preferred.iter().chain(t.requisite.iter()))
            .filter_map(|t| t.segments.get(LabelKey::TOPOLOGY_NODE.as_str()))
            .map(String::as_str)
            .collect();
        return Error::ResourceExhausted(format!(
            "no drive found for requested topology; requested node(s): {}; requested size: {} bytes",
            nodes.join(","),
            placement.required_bytes
        ));
    }
    if placement.required_bytes > 0 {
        return Error::OutOfRange(format!(
            "no drive found for requested size {}",
            placement.required_bytes
        ));
    }
    Error::FailedPrecondition("no drive found".to_string())
}

/// Binds volumes to drives over the Drive store
pub struct Scheduler {
    drives: DriveStoreRef,
}

impl Scheduler {
    pub fn new(drives: DriveStoreRef) -> Self {
        Self { drives }
    }

    /// Drive already holding the finalizer of `volume`, if any
    pub async fn bound_drive(&self, volume: &str) -> Result<Option<Drive>> {
        let finalizer = volume_finalizer(volume);
        Ok(self
            .drives
            .list(&LabelSelector::everything())
            .await?
            .into_iter()
            .find(|d| d.has_finalizer(&finalizer)))
    }

    /// Bind the volume to a drive and reserve its capacity. Returns the
    /// bound drive; repeated calls for the same volume return the same one.
    pub async fn schedule(&self, placement: &Placement) -> Result<Drive> {
        let mut attempt = 1;
        loop {
            match self.try_schedule(placement).await {
                Err(e) if e.is_conflict() && attempt < SCHEDULE_ATTEMPTS => {
                    debug!(volume = %placement.volume, attempt, "chosen drive changed, rescheduling");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn try_schedule(&self, placement: &Placement) -> Result<Drive> {
        let drives = self.drives.list(&LabelSelector::everything()).await?;
        let finalizer = volume_finalizer(&placement.volume);
        if let Some(bound) = drives.iter().find(|d| d.has_finalizer(&finalizer)) {
            debug!(volume = %placement.volume, drive = %bound.name_any(), "volume already bound");
            return Ok(bound.clone());
        }

        let chosen = select_drive(&drives, placement, &mut rand::rng())?.name_any();
        let required = placement.required_bytes;
        let drive = retry_on_conflict(self.drives.as_ref(), &chosen, |d: &mut Drive| {
            if d.has_finalizer(&finalizer) {
                return Ok(false);
            }
            // The listed copy may be stale; pick again if the drive no longer fits.
            if !drive_matches(d, placement) {
                return Err(Error::conflict("drive", d.name_any()));
            }
            d.add_finalizer(&finalizer);
            let status = d.status.get_or_insert_with(Default::default);
            status.allocated_capacity += required;
            status.free_capacity = status.free_capacity.saturating_sub(required);
            status.drive_status = DrivePhase::InUse;
            Ok(true)
        })
        .await?;

        info!(
            volume = %placement.volume,
            drive = %chosen,
            node = %drive.node_name(),
            bytes = required,
            "volume scheduled"
        );
        Ok(drive)
    }

    /// Drop the volume's finalizer from `drive` and give back its capacity.
    /// A no-op when the finalizer is already gone.
    pub async fn release(&self, drive: &str, volume: &str, capacity: u64) -> Result<()> {
        let finalizer = volume_finalizer(volume);
        let result = retry_on_conflict(self.drives.as_ref(), drive, |d: &mut Drive| {
            if !d.remove_finalizer(&finalizer) {
                return Ok(false);
            }
            let has_volumes = d.has_volume_finalizers();
            let status = d.status.get_or_insert_with(Default::default);
            status.allocated_capacity = status.allocated_capacity.saturating_sub(capacity);
            status.free_capacity = (status.free_capacity + capacity).min(status.total_capacity);
            if !has_volumes && status.drive_status == DrivePhase::InUse {
                status.drive_status = DrivePhase::Ready;
            }
            Ok(true)
        })
        .await;
        match result {
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
            Ok(_) => {
                info!(volume = %volume, drive = %drive, bytes = capacity, "volume released");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DriveSpec, DriveStatus};
    use crate::testing::runtime;
    use assert_matches::assert_matches;
    use chrono::Utc;
    use std::collections::{BTreeMap, HashMap};

    const GIB: u64 = 1024 * 1024 * 1024;

    fn drive(name: &str, free: u64, topology: &[(&str, &str)]) -> Drive {
        let mut d = Drive::new(name, DriveSpec::default());
        let mut status = DriveStatus {
            drive_status: DrivePhase::Ready,
            node_name: "n1".into(),
            filesystem: "xfs".into(),
            total_capacity: free,
            free_capacity: free,
            topology: topology
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            ..Default::default()
        };
        status.set_condition(condition::READY, true, "Formatted", "", Utc::now());
        d.status = Some(status);
        d
    }

    fn placement(volume: &str, bytes: u64) -> Placement {
        Placement {
            volume: volume.into(),
            required_bytes: bytes,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_free_capacity_winner() {
        let (rt, _) = runtime();
        for (name, free) in [("d1", 2 * GIB), ("d2", 4 * GIB), ("d3", 4 * GIB)] {
            rt.drives.create(&drive(name, free, &[])).await.unwrap();
        }
        let scheduler = Scheduler::new(rt.drives.clone());

        let chosen = scheduler.schedule(&placement("volume-1", 2 * GIB)).await.unwrap();
        assert!(["d2", "d3"].contains(&chosen.name_any().as_str()));
        assert!(chosen.has_finalizer("directpv.min.io.volume/volume-1"));

        let status = chosen.status.unwrap();
        assert_eq!(status.free_capacity, 2 * GIB);
        assert_eq!(status.allocated_capacity, 2 * GIB);
        assert_eq!(status.drive_status, DrivePhase::InUse);
    }

    #[test]
    fn test_ties_are_spread() {
        let drives = vec![drive("d1", 4 * GIB, &[]), drive("d2", 4 * GIB, &[])];
        let mut seen = HashMap::new();
        let mut rng = rand::rng();
        for _ in 0..200 {
            let d = select_drive(&drives, &placement("v", GIB), &mut rng).unwrap();
            *seen.entry(d.name_any()).or_insert(0) += 1;
        }
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn test_topology_filter() {
        let (rt, _) = runtime();
        rt.drives
            .create(&drive("d1", 8 * GIB, &[("directpv.min.io/region", "r1")]))
            .await
            .unwrap();
        rt.drives
            .create(&drive("d2", 4 * GIB, &[("directpv.min.io/region", "r2")]))
            .await
            .unwrap();
        let scheduler = Scheduler::new(rt.drives.clone());

        let mut p = placement("volume-1", GIB);
        p.topology = Some(TopologyRequirement {
            requisite: vec![Topology::new([("directpv.min.io/region", "r2")])],
            preferred: Vec::new(),
        });
        let chosen = scheduler.schedule(&p).await.unwrap();
        assert_eq!(chosen.name_any(), "d2");

        p.volume = "volume-2".into();
        p.topology = Some(TopologyRequirement {
            requisite: vec![Topology::new([("directpv.min.io/region", "r3")])],
            preferred: Vec::new(),
        });
        assert_matches!(scheduler.schedule(&p).await, Err(Error::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn test_scheduling_is_idempotent() {
        let (rt, _) = runtime();
        rt.drives.create(&drive("d1", 4 * GIB, &[])).await.unwrap();
        rt.drives.create(&drive("d2", 4 * GIB, &[])).await.unwrap();
        let scheduler = Scheduler::new(rt.drives.clone());

        let first = scheduler.schedule(&placement("volume-1", GIB)).await.unwrap();
        let second = scheduler.schedule(&placement("volume-1", GIB)).await.unwrap();
        assert_eq!(first.name_any(), second.name_any());

        let all = rt.drives.list(&LabelSelector::everything()).await.unwrap();
        let count: usize = all
            .iter()
            .map(|d| {
                d.finalizers()
                    .iter()
                    .filter(|f| *f == "directpv.min.io.volume/volume-1")
                    .count()
            })
            .sum();
        assert_eq!(count, 1);
        assert_eq!(
            scheduler.bound_drive("volume-1").await.unwrap().unwrap().name_any(),
            first.name_any()
        );
    }

    #[tokio::test]
    async fn test_error_kinds() {
        let (rt, _) = runtime();
        let scheduler = Scheduler::new(rt.drives.clone());
        assert_matches!(
            scheduler.schedule(&placement("v", 0)).await,
            Err(Error::FailedPrecondition(_))
        );

        rt.drives.create(&drive("d1", GIB, &[])).await.unwrap();
        assert_matches!(
            scheduler.schedule(&placement("v", 2 * GIB)).await,
            Err(Error::OutOfRange(_))
        );
    }

    #[test]
    fn test_filters() {
        let p = placement("v", GIB);
        let mut d = drive("d1", 2 * GIB, &[]);
        assert!(drive_matches(&d, &p));

        let mut tiered = p.clone();
        tiered.access_tier = Some(AccessTier::Hot);
        assert!(!drive_matches(&d, &tiered));
        d.status.as_mut().unwrap().access_tier = AccessTier::Hot;
        assert!(drive_matches(&d, &tiered));

        let mut ext4 = p.clone();
        ext4.filesystem = "ext4".into();
        assert!(!drive_matches(&d, &ext4));

        d.status.as_mut().unwrap().drive_status = DrivePhase::Released;
        assert!(!drive_matches(&d, &p));

        let mut not_ready = drive("d2", 2 * GIB, &[]);
        not_ready
            .status
            .as_mut()
            .unwrap()
            .set_condition(condition::READY, false, "Unmounted", "", Utc::now());
        assert!(!drive_matches(&not_ready, &p));
    }

    #[tokio::test]
    async fn test_release_returns_capacity() {
        let (rt, _) = runtime();
        rt.drives.create(&drive("d1", 4 * GIB, &[])).await.unwrap();
        let scheduler = Scheduler::new(rt.drives.clone());
        scheduler.schedule(&placement("volume-1", GIB)).await.unwrap();

        scheduler.release("d1", "volume-1", GIB).await.unwrap();
        scheduler.release("d1", "volume-1", GIB).await.unwrap();
        scheduler.release("gone", "volume-1", GIB).await.unwrap();

        let status = rt.drives.get("d1").await.unwrap().status.unwrap();
        assert_eq!(status.free_capacity, 4 * GIB);
        assert_eq!(status.allocated_capacity, 0);
        assert_eq!(status.drive_status, DrivePhase::Ready);
    }
}
