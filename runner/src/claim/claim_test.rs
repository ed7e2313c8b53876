use super::{ClaimBroker, ClaimOutcome, FsClaimBroker, BID_EXTENSION};
use std::{
    fs,
    sync::{Arc, Barrier},
    thread,
    time::Duration,
};

fn bid_files(folder: &std::path::Path) -> Vec<String> {
    fs::read_dir(folder)
        .unwrap()
        .filter_map(|entry| {
            let path = entry.unwrap().path();
            (path.extension().map(|ext| ext == BID_EXTENSION) == Some(true))
                .then(|| path.file_name().unwrap().to_string_lossy().into_owned())
        })
        .collect()
}

#[test]
fn sole_claimant_wins() {
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("job");
    fs::create_dir(&folder).unwrap();

    let broker = FsClaimBroker::new(7, Duration::from_millis(5));
    assert_eq!(broker.claim(&folder).unwrap(), ClaimOutcome::Won);
    // the winning bid stays in place as the claim marker
    assert_eq!(bid_files(&folder), vec!["7.bid".to_owned()]);

    broker.release(&folder).unwrap();
    assert!(bid_files(&folder).is_empty());
}

#[test]
fn existing_bid_blocks_new_claimants() {
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("job");
    fs::create_dir(&folder).unwrap();
    fs::write(folder.join("3.bid"), []).unwrap();

    let broker = FsClaimBroker::new(1, Duration::from_millis(5));
    assert_eq!(broker.claim(&folder).unwrap(), ClaimOutcome::Lost);
    // the loser placed nothing
    assert_eq!(bid_files(&folder), vec!["3.bid".to_owned()]);
}

#[test]
fn missing_folder_is_lost() {
    let dir = tempfile::tempdir().unwrap();
    let broker = FsClaimBroker::new(1, Duration::from_millis(5));

    assert_eq!(
        broker.claim(&dir.path().join("gone")).unwrap(),
        ClaimOutcome::Lost
    );
}

#[test]
fn concurrent_claimants_elect_exactly_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("job");
    fs::create_dir(&folder).unwrap();

    let claimants = 8;
    let barrier = Arc::new(Barrier::new(claimants as usize));

    let handles: Vec<_> = (1..=claimants)
        .map(|claimant| {
            let barrier = barrier.clone();
            let folder = folder.clone();

            thread::spawn(move || {
                let broker = FsClaimBroker::new(claimant, Duration::from_millis(50));
                barrier.wait();

                (claimant, broker.claim(&folder).unwrap())
            })
        })
        .collect();

    let outcomes: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    let winners: Vec<_> = outcomes
        .iter()
        .filter(|(_, outcome)| *outcome == ClaimOutcome::Won)
        .map(|(claimant, _)| *claimant)
        .collect();
    assert_eq!(winners.len(), 1, "outcomes: {outcomes:?}");

    // losers leave no residual files, only the winner's marker remains
    assert_eq!(bid_files(&folder), vec![format!("{}.bid", winners[0])]);
}

#[test]
fn smaller_bid_arriving_during_settle_wins() {
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("job");
    fs::create_dir(&folder).unwrap();

    let broker = FsClaimBroker::new(9, Duration::from_millis(200));
    let handle = {
        let folder = folder.clone();
        thread::spawn(move || broker.claim(&folder).unwrap())
    };

    // a concurrent bidder whose write lands inside the settle window
    thread::sleep(Duration::from_millis(50));
    fs::write(folder.join("2.bid"), []).unwrap();

    assert_eq!(handle.join().unwrap(), ClaimOutcome::Lost);
    // the loser withdrew its own bid, the smaller one remains
    assert_eq!(bid_files(&folder), vec!["2.bid".to_owned()]);
}
