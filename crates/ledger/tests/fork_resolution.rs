use filechain_ledger::{validate_chain, Ledger, LedgerConfig, LedgerError};
use filechain_storage::JsonChainStore;
use filechain_types::{FileRecord, RegistrationEvent};
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

fn register(name: &str, uploader: &str) -> RegistrationEvent {
    RegistrationEvent::register(FileRecord::new(
        name,
        format!("/srv/{name}"),
        name.as_bytes(),
        uploader,
    ))
}

#[test]
fn longest_valid_fork_wins_and_is_persisted() {
    let dir = tempdir().unwrap();
    let config = LedgerConfig::with_difficulty(1);

    let mut a = Ledger::open(
        config.clone(),
        Arc::new(JsonChainStore::new(dir.path().join("a.json"))),
    )
    .unwrap();
    let mut b = Ledger::in_memory(config.clone()).unwrap();

    a.append(register("a1", "node-a")).unwrap();
    for i in 0..3 {
        b.append(register(&format!("b{i}"), "node-b")).unwrap();
    }

    // B is ahead, so A adopts B's fork.
    assert_eq!(a.replace(b.chain().to_vec()).unwrap(), 1);
    assert_eq!(a.chain(), b.chain());
    assert!(validate_chain(a.chain()));

    // A cannot be pushed back onto anything of equal length.
    let err = b.replace(a.chain().to_vec()).unwrap_err();
    assert!(matches!(err, LedgerError::ChainNotLonger { .. }));

    let reopened = Ledger::open(
        config,
        Arc::new(JsonChainStore::new(dir.path().join("a.json"))),
    )
    .unwrap();
    assert_eq!(reopened.chain(), b.chain());
    let names: Vec<_> = reopened
        .all_files()
        .into_iter()
        .map(|f| f.filename)
        .collect();
    assert_eq!(names, vec!["b2", "b1", "b0"]);
}

#[test]
fn concurrent_writers_extend_one_chain() {
    let ledger = Ledger::in_memory(LedgerConfig::with_difficulty(1))
        .unwrap()
        .into_shared();

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let ledger = ledger.clone();
            thread::spawn(move || {
                for i in 0..5 {
                    ledger
                        .lock()
                        .append(register(&format!("w{worker}-{i}"), "node-a"))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let ledger = ledger.lock();
    assert_eq!(ledger.len(), 21);
    assert!(validate_chain(ledger.chain()));
    assert_eq!(ledger.all_files().len(), 20);
}
