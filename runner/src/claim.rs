#[cfg(test)]
mod claim_test;

use std::{fs, io, path::Path, path::PathBuf, thread, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};

/// extension of transient bid files inside a job folder
pub const BID_EXTENSION: &str = "bid";

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("failed to remove own bid")]
    ReleaseBid(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// sole visible minimum after settling, the own bid stays as claim marker
    Won,
    /// another claimant is ahead or the folder is gone
    Lost,
}

/// Arbitration of exactly one executor per job folder among independent
/// processes. Kept abstract so a future implementation could back it with a
/// store offering conditional writes without changing the manager's control
/// flow.
pub trait ClaimBroker {
    /// numeric identifier this broker bids with
    fn claimant(&self) -> u64;

    /// run one bidding round against `folder`
    fn claim(&self, folder: &Path) -> Result<ClaimOutcome, ClaimError>;

    /// withdraw the own claim marker, if present
    fn release(&self, folder: &Path) -> Result<(), ClaimError>;
}

/// Filesystem-backed broker: bid files named by claimant id, a settle pause
/// to let concurrent writes land, then smallest-id-wins arbitration.
///
/// The settle pause only narrows the window in which a claimant that crashes
/// between bidding and settling can leave two survivors both seeing
/// themselves as minimum; it does not close it. An atomic create-if-absent
/// primitive per folder would, at the cost of the protocol's portability
/// across network filesystems.
#[derive(Debug, Clone)]
pub struct FsClaimBroker {
    claimant: u64,
    settle: Duration,
}

impl FsClaimBroker {
    pub fn new(claimant: u64, settle: Duration) -> Self {
        Self { claimant, settle }
    }

    fn bid_path(&self, folder: &Path) -> PathBuf {
        folder.join(format!("{}.{BID_EXTENSION}", self.claimant))
    }

    /// claimant ids of all currently visible bids
    fn list_bids(folder: &Path) -> io::Result<Vec<u64>> {
        let mut bids = Vec::new();

        for entry in fs::read_dir(folder)? {
            let path = entry?.path();

            if path.extension().map(|ext| ext == BID_EXTENSION) != Some(true) {
                continue;
            }

            match path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u64>().ok())
            {
                Some(claimant) => bids.push(claimant),
                None => warn!(path = ?path, "Ignoring bid file without a numeric claimant"),
            }
        }

        Ok(bids)
    }
}

impl ClaimBroker for FsClaimBroker {
    fn claimant(&self) -> u64 {
        self.claimant
    }

    fn claim(&self, folder: &Path) -> Result<ClaimOutcome, ClaimError> {
        // pre-check: someone else is ahead, or the job already finished
        if !folder.is_dir() {
            return Ok(ClaimOutcome::Lost);
        }
        match Self::list_bids(folder) {
            Ok(bids) if bids.is_empty() => {}
            _ => return Ok(ClaimOutcome::Lost),
        }

        // place own bid; the folder may vanish concurrently
        let own_bid = self.bid_path(folder);
        if let Err(error) = fs::write(&own_bid, []) {
            debug!(folder = ?folder, error = ?error, "Failed to place bid");

            return Ok(ClaimOutcome::Lost);
        }

        // settle: let concurrent bidders' writes land before arbitrating
        thread::sleep(self.settle);

        let bids = match Self::list_bids(folder) {
            Ok(bids) if !bids.is_empty() => bids,
            _ => {
                let _ = fs::remove_file(&own_bid);

                return Ok(ClaimOutcome::Lost);
            }
        };

        // smallest visible claimant wins, everyone else withdraws
        match bids.into_iter().min() {
            Some(winner) if winner == self.claimant => Ok(ClaimOutcome::Won),
            _ => {
                fs::remove_file(&own_bid).map_err(ClaimError::ReleaseBid)?;

                Ok(ClaimOutcome::Lost)
            }
        }
    }

    fn release(&self, folder: &Path) -> Result<(), ClaimError> {
        match fs::remove_file(self.bid_path(folder)) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(ClaimError::ReleaseBid(error)),
        }
    }
}
