use std::sync::Arc;
use std::time::Duration;

use synod::{runner, Config, Error, System};

fn config(count: usize) -> Config<String, u64> {
    Config::new(count)
        .with_timeout(Duration::from_secs(5))
        .with_poll_interval(Duration::from_millis(1))
        .with_max_poll_interval(Duration::from_millis(10))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_proposals_on_distinct_keys() {
    let running = Arc::new(runner::spawn(Arc::new(System::memory(config(3)))));
    let proposals = vec![("K1", 11111), ("K2", 22222), ("K3", 33333)];

    let waiting = proposals.iter()
        .enumerate()
        .map(|(uid, (key, value))| {
            let running = running.clone();
            let key = key.to_string();
            let value = *value;
            tokio::spawn(async move { running.propose_value(uid, key, value).await })
        })
        .collect::<Vec<_>>();
    for (joined, (_, value)) in futures::future::join_all(waiting).await.into_iter().zip(&proposals) {
        assert_eq!(joined.unwrap().unwrap(), *value);
    }

    for uid in 0..3 {
        for (key, value) in &proposals {
            let decided = running.wait_final_value(uid, &key.to_string(), Duration::from_secs(5)).await.unwrap();
            assert_eq!(decided, *value);
        }
    }

    let running = Arc::try_unwrap(running).ok().unwrap();
    running.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_proposals_on_one_key_agree() {
    let running = runner::spawn(Arc::new(System::memory(config(3))));
    let key = "K1".to_string();

    let (a, b, c) = futures::join!(
        running.propose_value(0, key.clone(), 1),
        running.propose_value(1, key.clone(), 2),
        running.propose_value(2, key.clone(), 3),
    );
    let decided = vec![a.unwrap(), b.unwrap(), c.unwrap()];
    assert!(decided.iter().all(|value| *value == decided[0]));
    assert!([1, 2, 3].contains(&decided[0]));

    running.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn proposal_without_quorum_times_out() {
    let system = Arc::new(System::memory(config(3).with_timeout(Duration::from_millis(200))));
    let running = runner::spawn_partial(system.clone(), &[0]);

    let outcome = running.propose_value(0, "K1".to_string(), 4).await;
    assert!(matches!(outcome, Err(Error::Timeout)));
    running.shutdown().await.unwrap();

    // The round was left in progress and finishes once peers deliver
    assert!(system.run_until_quiescent(100).unwrap());
    for participant in system.participants() {
        assert_eq!(participant.get_final_value(&"K1".to_string()).unwrap(), 4);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_backed_uncached_roster_resolves() {
    let dir = tempfile::tempdir().unwrap();
    let system = System::file(config(3).with_cache(false), dir.path()).unwrap();
    let running = runner::spawn(Arc::new(system));
    let key = "K1".to_string();

    let (a, b, c) = futures::join!(
        running.propose_value(0, key.clone(), 1),
        running.propose_value(1, key.clone(), 2),
        running.propose_value(2, key.clone(), 3),
    );
    let decided = a.unwrap();
    assert_eq!(b.unwrap(), decided);
    assert_eq!(c.unwrap(), decided);
    running.shutdown().await.unwrap();
}
