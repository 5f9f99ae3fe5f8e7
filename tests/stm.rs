// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use persistent_stm::{PersistentHashMap, Stm, StmError};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
};
use threadpool::ThreadPool;

#[ctor::ctor]
/// This function will be run before any of the tests
fn init_logger() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Info)
        .try_init();
}

#[test]
fn test_atomic_set_and_deref() {
    let stm = Stm::default();
    let r = stm.create(41usize);

    let r1 = r.clone();
    let result = stm.atomic(move || {
        let v = r1.deref()?;
        r1.set(v + 1)?;
        r1.deref()
    });

    assert_eq!(result, Ok(42));
    assert_eq!(r.deref(), Ok(42));
}

#[test]
fn test_alter_returns_new_value() {
    let stm = Stm::default();
    let r = stm.create(10usize);

    let r1 = r.clone();
    let result = stm.atomic(move || r1.alter(|v| v * 3));

    assert_eq!(result, Ok(30));
    assert_eq!(r.deref(), Ok(30));
}

#[test]
fn test_deref_outside_transaction_sees_latest_committed() {
    let stm = Stm::default();
    let r = stm.create("initial".to_string());

    assert_eq!(r.deref(), Ok("initial".to_string()));

    let r1 = r.clone();
    stm.atomic(move || r1.set("updated".to_string()))
        .expect("transaction failed");

    assert_eq!(r.deref(), Ok("updated".to_string()));
}

#[test]
fn test_writes_require_a_transaction() {
    let stm = Stm::default();
    let r = stm.create(0usize);

    assert_eq!(r.set(1), Err(StmError::NotInTransaction));
    assert_eq!(r.alter(|v| v + 1), Err(StmError::NotInTransaction));
    assert_eq!(r.commute(|v| v + 1), Err(StmError::NotInTransaction));
    assert_eq!(r.ensure(), Err(StmError::NotInTransaction));
    // the value is untouched
    assert_eq!(r.deref(), Ok(0));
}

#[test]
fn test_set_after_commute_is_rejected() {
    let stm = Stm::default();
    let r = stm.create(0usize);

    let r1 = r.clone();
    let result = stm.atomic(move || {
        r1.commute(|v| v + 1)?;
        r1.set(5)
    });

    assert_eq!(result, Err(StmError::SetAfterCommute));
    // the failed transaction left nothing behind
    assert_eq!(r.deref(), Ok(0));
}

#[test]
fn test_transfer_between_refs() {
    let stm = Stm::default();

    let bank_alice = stm.create(10usize);
    let bank_bob = stm.create(100usize);
    let bank_charly = stm.create(0usize);

    let (ba, bb, bc) = (bank_alice.clone(), bank_bob.clone(), bank_charly.clone());

    let transfer_bob_charly = 30;
    let alice_bonus = 40;
    let result = stm.atomic(move || {
        ba.alter(|amt| amt + alice_bonus)?;
        bb.alter(|amt| amt - transfer_bob_charly)?;
        bc.alter(|amt| amt + transfer_bob_charly)?;
        Ok(())
    });

    assert!(result.is_ok(), "transaction failed");
    assert_eq!(bank_alice.deref(), Ok(50));
    assert_eq!(bank_bob.deref(), Ok(70));
    assert_eq!(bank_charly.deref(), Ok(30));
}

#[test]
fn test_threaded_counter() {
    const THREADS: usize = 2;
    const INCREMENTS: usize = 1000;

    let stm = Stm::with_retry_limit(500);
    let counter = stm.create(0usize);

    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let stm = stm.clone();
        let counter = counter.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..INCREMENTS {
                let c = counter.clone();
                stm.atomic(move || c.alter(|v| v + 1))
                    .expect("increment failed");
            }
        }));
    }
    for handle in handles {
        handle.join().expect("worker panicked");
    }

    assert_eq!(counter.deref(), Ok(THREADS * INCREMENTS));
}

#[test]
fn test_disjoint_writes_never_retry() {
    const ITERATIONS: usize = 200;

    let stm = Stm::default();
    let left = stm.create(0usize);
    let right = stm.create(0usize);

    let mut handles = Vec::new();
    for r in [left.clone(), right.clone()] {
        let stm = stm.clone();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counted = attempts.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..ITERATIONS {
                let r = r.clone();
                let counted = counted.clone();
                stm.atomic(move || {
                    counted.fetch_add(1, Ordering::SeqCst);
                    r.alter(|v| v + 1)
                })
                .expect("transaction failed");
            }
            counted.load(Ordering::SeqCst)
        }));
    }

    for handle in handles {
        let attempts = handle.join().expect("worker panicked");
        // no shared reference, so every transaction commits first try
        assert_eq!(attempts, ITERATIONS);
    }
    assert_eq!(left.deref(), Ok(ITERATIONS));
    assert_eq!(right.deref(), Ok(ITERATIONS));
}

#[test]
fn test_contended_counter_threadpool() {
    const TASKS: usize = 8;
    const INCREMENTS: usize = 100;

    let stm = Stm::default();
    let counter = stm.create(0usize);
    let pool = ThreadPool::new(8);

    for _ in 0..TASKS {
        let stm = stm.clone();
        let counter = counter.clone();
        pool.execute(move || {
            for _ in 0..INCREMENTS {
                let c = counter.clone();
                stm.atomic(move || c.alter(|v| v + 1))
                    .expect("increment failed");
            }
        });
    }
    pool.join();

    assert_eq!(counter.deref(), Ok(TASKS * INCREMENTS));
}

#[test]
fn test_commute_composition() {
    const TASKS: usize = 4;
    const COMMUTES: usize = 250;

    let stm = Stm::default();
    let counter = stm.create(0usize);
    let pool = ThreadPool::new(TASKS);

    for _ in 0..TASKS {
        let stm = stm.clone();
        let counter = counter.clone();
        pool.execute(move || {
            for _ in 0..COMMUTES {
                let c = counter.clone();
                stm.atomic(move || c.commute(|v| v + 1))
                    .expect("commute failed");
            }
        });
    }
    pool.join();

    // commutes compose in commit order; the sum is exact
    assert_eq!(counter.deref(), Ok(TASKS * COMMUTES));
}

#[test]
fn test_abort_leaves_no_trace() {
    let stm = Stm::default();
    let r = stm.create(0usize);

    stm.begin().expect("begin failed");
    r.set(42).expect("set failed");
    assert_eq!(r.deref(), Ok(42), "in-transaction value visible inside");
    stm.abort();

    assert_eq!(r.deref(), Ok(0));
    assert_eq!(r.history_count(), 1);
    assert_eq!(r.faults(), 0);
    assert!(!stm.is_running());

    // nothing lingers: the reference is freely writable afterwards
    let r1 = r.clone();
    stm.atomic(move || r1.set(7)).expect("set after abort failed");
    assert_eq!(r.deref(), Ok(7));
}

#[test]
fn test_commit_points_advance_once_per_commit() {
    let stm = Stm::default();
    let r = stm.create(0usize);
    // creating a reference seeds its history without consuming a point
    assert_eq!(stm.last_commit_point(), 0);

    let r1 = r.clone();
    stm.atomic(move || r1.set(1)).expect("set failed");
    assert_eq!(stm.last_commit_point(), 1);

    // one point covers every reference written by a transaction
    let s = stm.create(0usize);
    let (r1, s1) = (r.clone(), s.clone());
    stm.atomic(move || {
        r1.set(2)?;
        s1.set(2)
    })
    .expect("set failed");
    assert_eq!(stm.last_commit_point(), 2);

    // read-only transactions publish nothing and take no point
    let r1 = r.clone();
    stm.atomic(move || r1.deref()).expect("deref failed");
    assert_eq!(stm.last_commit_point(), 2);

    // neither do aborted ones
    stm.begin().expect("begin failed");
    r.set(9).expect("set failed");
    stm.abort();
    assert_eq!(stm.last_commit_point(), 2);
    assert_eq!(r.deref(), Ok(2));
}

#[test]
fn test_manual_begin_commit() {
    let stm = Stm::default();
    let r = stm.create(1usize);

    stm.begin().expect("begin failed");
    assert!(stm.is_running());
    r.set(2).expect("set failed");
    stm.commit().expect("commit failed");

    assert!(!stm.is_running());
    assert_eq!(r.deref(), Ok(2));
}

#[test]
fn test_retry_limit_exceeded() {
    let stm = Stm::with_retry_limit(5);

    let result: Result<(), _> = stm.atomic(|| Err(StmError::Retry));

    assert_eq!(result, Err(StmError::RetryLimit { attempts: 5 }));
}

#[test]
fn test_atomic_or_else_reports_the_error() {
    let stm = Stm::with_retry_limit(3);
    let seen = Arc::new(AtomicUsize::new(0));

    let seen1 = seen.clone();
    let result: Option<()> = stm.atomic_or_else(
        || Err(StmError::Retry),
        move |err| {
            assert_eq!(err, &StmError::RetryLimit { attempts: 3 });
            seen1.fetch_add(1, Ordering::SeqCst);
        },
    );

    assert_eq!(result, None);
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    let r = stm.create(9usize);
    let r1 = r.clone();
    let value = stm.atomic_or_else(move || r1.deref(), |_| panic!("unexpected error"));
    assert_eq!(value, Some(9));
}

#[test]
fn test_nested_atomic_joins_the_outer_transaction() {
    let stm = Stm::default();
    let r = stm.create(0usize);

    let (stm1, r1) = (stm.clone(), r.clone());
    let result = stm.atomic(move || {
        r1.set(1)?;
        // the nested computation sees the outer in-transaction value
        let inner = stm1.atomic(|| r1.deref())?;
        assert_eq!(inner, 1);
        r1.set(inner + 1)?;
        r1.deref()
    });

    assert_eq!(result, Ok(2));
    assert_eq!(r.deref(), Ok(2));
}

#[test]
fn test_fault_requests_history_growth() {
    let stm = Stm::default();
    let r = stm.create(0usize);

    // open a transaction bound to the current (empty) read point
    stm.begin().expect("begin failed");

    // another thread commits, advancing the reference past our read point
    let (stm2, r2) = (stm.clone(), r.clone());
    thread::spawn(move || {
        let r3 = r2.clone();
        stm2.atomic(move || r3.set(1)).expect("writer failed");
    })
    .join()
    .expect("writer panicked");

    // depth-one history: every entry now postdates our read point
    assert_eq!(r.deref(), Err(StmError::Retry));
    assert_eq!(r.faults(), 1);
    stm.abort();

    // the recorded fault makes the next commit deepen the history
    let r1 = r.clone();
    stm.atomic(move || r1.set(2)).expect("set failed");
    assert_eq!(r.history_count(), 2);
    assert_eq!(r.faults(), 0);
}

#[test]
fn test_history_grows_to_min_bound() {
    let stm = Stm::default();
    let r = stm.create_with_history(0usize, 3, 10);
    assert_eq!(r.min_history(), 3);
    assert_eq!(r.max_history(), 10);

    for i in 0..5 {
        let r1 = r.clone();
        stm.atomic(move || r1.set(i)).expect("set failed");
    }

    // grows while below min, then recycles in place
    assert_eq!(r.history_count(), 3);
    assert_eq!(r.deref(), Ok(4));
}

#[test]
fn test_trim_history() {
    let stm = Stm::default();
    let r = stm.create_with_history(0usize, 3, 10);
    for i in 0..5 {
        let r1 = r.clone();
        stm.atomic(move || r1.set(i)).expect("set failed");
    }
    assert_eq!(r.history_count(), 3);

    r.set_min_history(1);
    r.trim_history();

    assert_eq!(r.history_count(), 1);
    assert_eq!(r.deref(), Ok(4));
}

#[test]
fn test_ensure_blocks_writers() {
    let stm = Stm::with_retry_limit(3);
    let r = stm.create(0usize);

    stm.begin().expect("begin failed");
    r.ensure().expect("ensure failed");

    // a writer cannot take write intent while the read intent is held
    let (stm2, r2) = (stm.clone(), r.clone());
    let writer = thread::spawn(move || {
        let r3 = r2.clone();
        stm2.atomic(move || r3.set(1))
    });
    assert_eq!(
        writer.join().expect("writer panicked"),
        Err(StmError::RetryLimit { attempts: 3 })
    );

    stm.abort();

    // released with the transaction
    let r1 = r.clone();
    stm.atomic(move || r1.set(1)).expect("set failed");
    assert_eq!(r.deref(), Ok(1));
}

#[test]
fn test_snapshot_is_consistent_across_refs() {
    const ROUNDS: usize = 200;

    let stm = Stm::default();
    let a = stm.create(0usize);
    let b = stm.create(0usize);

    let (stm_w, aw, bw) = (stm.clone(), a.clone(), b.clone());
    let writer = thread::spawn(move || {
        for _ in 0..ROUNDS {
            let (a, b) = (aw.clone(), bw.clone());
            stm_w
                .atomic(move || {
                    a.alter(|v| v + 1)?;
                    b.alter(|v| v + 1)?;
                    Ok(())
                })
                .expect("writer failed");
        }
    });

    let (stm_r, ar, br) = (stm.clone(), a.clone(), b.clone());
    let reader = thread::spawn(move || {
        for _ in 0..ROUNDS {
            let (a, b) = (ar.clone(), br.clone());
            let (va, vb) = stm_r
                .atomic(move || Ok((a.deref()?, b.deref()?)))
                .expect("reader failed");
            // both increments commit together; a torn pair is a broken snapshot
            assert_eq!(va, vb);
        }
    });

    writer.join().expect("writer panicked");
    reader.join().expect("reader panicked");
    assert_eq!(a.deref(), Ok(ROUNDS));
    assert_eq!(b.deref(), Ok(ROUNDS));
}

#[test]
fn test_persistent_map_inside_a_ref() {
    const TASKS: usize = 4;
    const KEYS_PER_TASK: usize = 50;

    let stm = Stm::default();
    let index = stm.create(PersistentHashMap::new());
    let pool = ThreadPool::new(TASKS);

    for task in 0..TASKS {
        let stm = stm.clone();
        let index = index.clone();
        pool.execute(move || {
            for i in 0..KEYS_PER_TASK {
                let key = format!("{:02}-{:03}", task, i);
                let index = index.clone();
                stm.atomic(move || {
                    let key = key.clone();
                    index.alter(move |m| m.insert(key.clone(), task))
                })
                .expect("insert failed");
            }
        });
    }
    pool.join();

    let snapshot = index.deref().expect("deref failed");
    assert_eq!(snapshot.len(), TASKS * KEYS_PER_TASK);
    for task in 0..TASKS {
        for i in 0..KEYS_PER_TASK {
            let key = format!("{:02}-{:03}", task, i);
            assert_eq!(snapshot.get(&key), Some(&task));
        }
    }

    // the snapshot is a value: later commits do not reach into it
    let index1 = index.clone();
    stm.atomic(move || index1.alter(|m| m.insert("late".to_string(), 99)))
        .expect("insert failed");
    assert_eq!(snapshot.len(), TASKS * KEYS_PER_TASK);
    assert!(!snapshot.contains_key(&"late".to_string()));
}
