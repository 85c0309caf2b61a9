use std::time::Duration;

use futures::executor::block_on;
use kairan_core::{JobStatus, JobStore, ManualClock, MemoryStore, NewJob, RequestType};
use proptest::prelude::*;

const LEASE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
enum Step {
    Claim(u8),
    Expire,
    Fail,
    Reset,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => (0u8..3).prop_map(Step::Claim),
        2 => Just(Step::Expire),
        1 => Just(Step::Fail),
        1 => Just(Step::Reset),
    ]
}

proptest! {
    #[test]
    fn attempts_never_exceed_the_ceiling(
        max_attempts in 1u16..6,
        steps in proptest::collection::vec(step(), 1..40),
    ) {
        let clock = ManualClock::default();
        let store = MemoryStore::with_clock(clock.clone());
        let job = block_on(store.create(
            NewJob::new(RequestType::DocumentSummary, serde_json::Map::new())
                .with_max_attempts(max_attempts),
        ))
        .unwrap();

        let mut claims = 0;
        let mut owner: Option<String> = None;
        for step in steps {
            match step {
                Step::Claim(worker) => {
                    let worker = format!("worker-{worker}");
                    if let Some(claimed) = block_on(store.claim_next(&worker, LEASE, &RequestType::ALL)).unwrap() {
                        claims += 1;
                        prop_assert_eq!(claimed.attempts, claims);
                        owner = Some(worker);
                    }
                }
                Step::Expire => clock.advance(LEASE + Duration::from_secs(1)),
                Step::Fail => {
                    if let Some(worker) = owner.take() {
                        block_on(store.fail(job.id, &worker, "boom", None)).unwrap();
                    }
                }
                Step::Reset => {
                    block_on(store.reset_to_pending(job.id)).unwrap();
                }
            }

            let current = block_on(store.get(job.id)).unwrap().unwrap();
            prop_assert!(current.attempts <= i32::from(max_attempts));
            if current.status == JobStatus::Processing {
                prop_assert!(current.attempts >= 1);
                prop_assert!(current.locked_by.is_some());
            }
        }
        prop_assert!(claims <= i32::from(max_attempts));
    }
}
