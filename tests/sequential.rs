use synod::{Config, Error, Event, Input, Message, Phase, ProposalId, System};

fn drain(system: &System<String, u64>) {
    assert!(system.run_until_quiescent(10_000).unwrap());
}

fn history(system: &System<String, u64>, key: &str) -> Vec<usize> {
    system.participants()
        .iter()
        .map(|participant| participant.repository().log().read(&key.to_string()).unwrap().len())
        .collect()
}

#[test]
fn distinct_keys_converge() {
    let system = System::memory(Config::new(3));
    let proposals = [("K1", 11111), ("K2", 22222), ("K3", 33333)];
    for (uid, (key, value)) in proposals.iter().enumerate() {
        system.participant(uid).unwrap().propose(key.to_string(), *value).unwrap();
    }
    drain(&system);

    for participant in system.participants() {
        for (key, value) in &proposals {
            assert_eq!(participant.get_final_value(&key.to_string()).unwrap(), *value);
        }
    }
}

#[test]
fn competing_proposals_agree() {
    let system = System::memory(Config::new(3));
    let key = "K1".to_string();
    system.participant(0).unwrap().propose(key.clone(), 1).unwrap();
    system.participant(1).unwrap().propose(key.clone(), 2).unwrap();
    drain(&system);

    let decided = system.participants()
        .iter()
        .map(|participant| participant.get_final_value(&key).unwrap())
        .collect::<Vec<_>>();
    assert!(decided[0] == 1 || decided[0] == 2);
    assert!(decided.iter().all(|value| *value == decided[0]));
}

#[test]
fn propose_value_reports_the_decision() {
    let system = System::memory(Config::new(5));
    assert_eq!(system.propose_value(3, "K2".to_string(), 7).unwrap(), 7);

    // A later proposal learns the existing decision
    assert_eq!(system.propose_value(4, "K2".to_string(), 8).unwrap(), 7);
}

#[test]
fn deliveries_take_effect_once() {
    let system = System::memory(Config::new(3));
    let key = "K1".to_string();
    system.participant(2).unwrap().propose(key.clone(), 5).unwrap();
    drain(&system);
    let before = history(&system, "K1");

    drain(&system);
    for participant in system.participants() {
        for upstream in participant.upstreams() {
            assert_eq!(participant.poll_upstream(upstream.uid(), 0, 100).unwrap(), 0);
        }
    }
    assert_eq!(history(&system, "K1"), before);

    // Replaying an applied position is a no-op
    let participant = system.participant(0).unwrap();
    let prepare = Input::Deliver(Message::Prepare { from: 2, proposal_id: ProposalId::new(1, 2) });
    let tracking = synod::storage::Tracking { upstream: 2, pipeline: 0, position: 1 };
    assert_eq!(participant.repository().apply(&key, &prepare, 0, Some(tracking)).unwrap(), None);
    assert_eq!(history(&system, "K1"), before);
}

#[test]
fn majority_is_enough() {
    let system = System::memory(Config::new(5));
    let key = "K1".to_string();
    system.participant(0).unwrap().propose(key.clone(), 9).unwrap();

    let live = &system.participants()[..3];
    while live.iter().map(|participant| participant.poll().unwrap()).sum::<usize>() > 0 {}
    for participant in live {
        assert_eq!(participant.get_final_value(&key).unwrap(), 9);
    }
    for participant in &system.participants()[3..] {
        assert!(matches!(participant.get_final_value(&key), Err(Error::NotResolved)));
    }

    // Stragglers catch up from the logs
    drain(&system);
    for participant in system.participants() {
        assert_eq!(participant.get_final_value(&key).unwrap(), 9);
    }
}

#[test]
fn minority_cannot_decide() {
    let system = System::memory(Config::new(5));
    let key = "K1".to_string();
    system.participant(0).unwrap().propose(key.clone(), 9).unwrap();

    let live = &system.participants()[..2];
    for _ in 0..10 {
        for participant in live {
            participant.poll().unwrap();
        }
    }
    for participant in system.participants() {
        assert!(matches!(participant.get_final_value(&key), Err(Error::NotResolved)));
    }
    let instance = system.participant(0).unwrap().aggregate(&key).unwrap();
    assert_eq!(instance.instance().promises_received(), 2);
}

#[test]
fn proposals_spread_over_pipelines_resolve() {
    let system = System::memory(Config::new(3).with_pipelines(vec![1, 2]));
    for (uid, pipeline) in [(0, 1), (1, 2), (2, 0)].iter() {
        let participant = system.participant(*uid).unwrap();
        participant.change_pipeline(*pipeline);
        participant.propose(format!("K{}", uid), *uid as u64).unwrap();
    }
    drain(&system);

    for participant in system.participants() {
        for uid in 0..3 {
            assert_eq!(participant.get_final_value(&format!("K{}", uid)).unwrap(), uid as u64);
        }
    }
    let published = |uid: usize, pipeline| {
        system.participant(uid).unwrap().repository().log().read_from(pipeline, 0, 1000).unwrap()
    };
    assert!(published(0, 1).iter().all(|notification| notification.key == "K0"));
    assert!(published(1, 2).iter().all(|notification| notification.key == "K1"));
    assert!(!published(0, 2).iter().any(|notification| notification.key == "K0"));
}

#[test]
fn three_proposers_on_one_key_agree() {
    for batch in [1, 2, 3, 4, 8, 64].iter() {
        for _ in 0..4 {
            let system = System::memory(Config::new(3).with_batch(*batch));
            let key = "K1".to_string();
            for uid in 0..3 {
                system.participant(uid).unwrap().propose(key.clone(), uid as u64).unwrap();
            }
            assert!(system.run_until_quiescent(20_000).unwrap(), "batch {} never went quiet", batch);

            let decided = system.participants()
                .iter()
                .map(|participant| participant.get_final_value(&key).unwrap())
                .collect::<Vec<_>>();
            assert!(decided.iter().all(|value| *value == decided[0]), "batch {}: {:?}", batch, decided);
            assert!(decided[0] < 3);
            for participant in system.participants() {
                assert_eq!(participant.pending_restarts(), 0);
            }
        }
    }
}

#[test]
fn preempted_proposer_restarts_with_higher_round() {
    let system = System::memory(Config::new(3));
    let key = "K1".to_string();
    let (p0, p1, p2) = (
        system.participant(0).unwrap(),
        system.participant(1).unwrap(),
        system.participant(2).unwrap(),
    );

    // p2 promises round 1.1, then rejects the lower round 1.0
    p1.propose(key.clone(), 1).unwrap();
    p2.poll_upstream(1, 0, 100).unwrap();
    p0.propose(key.clone(), 0).unwrap();
    p2.poll_upstream(0, 0, 100).unwrap();
    p0.poll_upstream(2, 0, 100).unwrap();

    assert_eq!(p0.aggregate(&key).unwrap().instance().phase(), Phase::Preempted);
    assert_eq!(p0.pending_restarts(), 1);

    // Only p0 delivers, so nothing but the restart can change its round
    for _ in 0..1000 {
        if p0.pending_restarts() == 0 {
            break
        }
        p0.poll().unwrap();
    }
    assert_eq!(p0.pending_restarts(), 0);

    let history = p0.repository().log().read(&key).unwrap();
    let nacked = history.iter()
        .position(|event| match event {
            | Event::Received(Message::Nack { proposer: 0, proposal_id, .. }) => *proposal_id == ProposalId::new(1, 0),
            | _ => false,
        })
        .unwrap();
    let restarted = history[nacked..].iter().find_map(|event| match event {
        | Event::Announced(Message::Prepare { from: 0, proposal_id }) => Some(*proposal_id),
        | _ => None,
    });
    assert!(restarted.unwrap() > ProposalId::new(1, 1));

    drain(&system);
    let decided = p0.get_final_value(&key).unwrap();
    for participant in system.participants() {
        assert_eq!(participant.get_final_value(&key).unwrap(), decided);
    }
}
