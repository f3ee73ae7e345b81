//! Claim-protocol tests against a live Oracle database.
//!
//! Built only with `--features oracle`. Reads ORACLE_USER, ORACLE_PASSWORD
//! and ORACLE_CONNECT_STRING, defaulting to a local Oracle Free container
//! (`system` / `password` at `localhost:1521/free`).
#![cfg(feature = "oracle")]

use email_outbox::config::OracleConfig;
use email_outbox::error::Error;
use email_outbox::model::{Email, EmailId};
use email_outbox::outbox::{OracleOutbox, OracleTx, Outbox};
use secrecy::SecretString;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

static SERIAL: Mutex<()> = Mutex::const_new(());

const NON_BLOCKING: Duration = Duration::from_secs(5);

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

async fn oracle() -> (OracleOutbox, MutexGuard<'static, ()>) {
    let guard = SERIAL.lock().await;
    let outbox = OracleOutbox::new(OracleConfig {
        username: env_or("ORACLE_USER", "system"),
        password: SecretString::from(env_or("ORACLE_PASSWORD", "password")),
        connect_string: env_or("ORACLE_CONNECT_STRING", "localhost:1521/free"),
    });
    outbox.provision_schema().await.unwrap();
    outbox.reset_all().await.unwrap();
    (outbox, guard)
}

async fn enqueue(outbox: &OracleOutbox, recipient: &str) -> EmailId {
    outbox
        .insert(&Email::new(recipient, "hello", "world"))
        .await
        .unwrap()
}

async fn claim(outbox: &OracleOutbox, tx: &mut OracleTx) -> Option<Email> {
    tokio::time::timeout(NON_BLOCKING, outbox.claim_one(tx))
        .await
        .expect("claim waited on another session's lock")
        .unwrap()
}

#[tokio::test]
#[ignore] // Requires running Oracle
async fn oracle_nothing_to_do() {
    let (outbox, _serial) = oracle().await;
    let mut tx = outbox.begin().await.unwrap();
    assert!(claim(&outbox, &mut tx).await.is_none());
    outbox.commit(tx).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires running Oracle
async fn oracle_work_division() {
    let (outbox, _serial) = oracle().await;
    enqueue(&outbox, "test1").await;
    enqueue(&outbox, "test2").await;

    let mut tx1 = outbox.begin().await.unwrap();
    let email1 = claim(&outbox, &mut tx1).await.expect("first claim");
    assert_eq!(email1.recipient, "test1");
    assert_eq!(email1.subject, "hello");
    assert_eq!(email1.body, "world");

    let mut tx2 = outbox.begin().await.unwrap();
    let email2 = claim(&outbox, &mut tx2).await.expect("second claim");
    assert_eq!(email2.recipient, "test2");

    let mut tx3 = outbox.begin().await.unwrap();
    assert!(claim(&outbox, &mut tx3).await.is_none());

    outbox.commit(tx2).await.unwrap();
    outbox.commit(tx3).await.unwrap();
    outbox.commit(tx1).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires running Oracle
async fn oracle_removed_email_is_gone() {
    let (outbox, _serial) = oracle().await;
    let id = enqueue(&outbox, "test1").await;

    let mut tx = outbox.begin().await.unwrap();
    let email = claim(&outbox, &mut tx).await.unwrap();
    assert_eq!(email.id, Some(id));
    outbox.remove(&mut tx, &email).await.unwrap();
    outbox.commit(tx).await.unwrap();

    assert_eq!(outbox.count().await.unwrap(), 0);
}

#[tokio::test]
#[ignore] // Requires running Oracle
async fn oracle_rollback_keeps_email() {
    let (outbox, _serial) = oracle().await;
    let id = enqueue(&outbox, "test1").await;

    let mut tx = outbox.begin().await.unwrap();
    let email = claim(&outbox, &mut tx).await.unwrap();
    outbox.remove(&mut tx, &email).await.unwrap();
    outbox.rollback(tx).await.unwrap();

    let mut retry = outbox.begin().await.unwrap();
    assert_eq!(claim(&outbox, &mut retry).await.unwrap().id, Some(id));
    outbox.commit(retry).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires running Oracle
async fn oracle_dropped_session_releases_claim() {
    let (outbox, _serial) = oracle().await;
    let id = enqueue(&outbox, "test1").await;

    let mut crashed = outbox.begin().await.unwrap();
    assert!(claim(&outbox, &mut crashed).await.is_some());
    drop(crashed);

    let mut tx = outbox.begin().await.unwrap();
    assert_eq!(claim(&outbox, &mut tx).await.unwrap().id, Some(id));
    outbox.commit(tx).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires running Oracle
async fn oracle_second_claim_in_same_session_takes_another() {
    let (outbox, _serial) = oracle().await;
    enqueue(&outbox, "test1").await;
    enqueue(&outbox, "test2").await;

    let mut tx = outbox.begin().await.unwrap();
    let first = claim(&outbox, &mut tx).await.unwrap();
    let second = claim(&outbox, &mut tx).await.unwrap();
    assert_ne!(first.id, second.id);
    assert!(claim(&outbox, &mut tx).await.is_none());
    assert_eq!(tx.claimed().count(), 2);
    outbox.commit(tx).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires running Oracle
async fn oracle_remove_requires_own_claim() {
    let (outbox, _serial) = oracle().await;
    enqueue(&outbox, "test1").await;

    let mut owner = outbox.begin().await.unwrap();
    let email = claim(&outbox, &mut owner).await.unwrap();

    let mut intruder = outbox.begin().await.unwrap();
    let err = outbox.remove(&mut intruder, &email).await.unwrap_err();
    assert!(matches!(err, Error::ProtocolViolation(_)), "got {err:?}");

    outbox.commit(intruder).await.unwrap();
    outbox.commit(owner).await.unwrap();
    assert_eq!(outbox.count().await.unwrap(), 1);
}

#[tokio::test]
#[ignore] // Requires running Oracle
async fn oracle_provisioning_is_idempotent() {
    let (outbox, _serial) = oracle().await;
    outbox.provision_schema().await.unwrap();
    enqueue(&outbox, "test1").await;
    outbox.provision_schema().await.unwrap();
    assert_eq!(outbox.count().await.unwrap(), 1);
}
