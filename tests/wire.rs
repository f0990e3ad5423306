use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use medslot::clock::ManualClock;
use medslot::engine::EngineSettings;
use medslot::sweeper::SweepSettings;
use medslot::tenant::TenantManager;
use medslot::wire;

// Monday 2026-03-16 00:00 UTC; the server clock sits on the Sunday before.
const MONDAY: i64 = 1_773_619_200_000;
const HOUR: i64 = 3_600_000;
const MINUTE: i64 = 60_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("medslot_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let clock = Arc::new(ManualClock::new(MONDAY - 24 * HOUR));
    let tm = Arc::new(
        TenantManager::new(dir, EngineSettings::default(), SweepSettings::default()).with_clock(clock),
    );

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "medslot".to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr, db: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(db)
        .user("medslot")
        .password("medslot");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(r) => Some(r),
            _ => None,
        })
        .collect()
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.batch_execute(sql).await.expect_err("statement should fail");
    err.code().expect("database error").code().to_string()
}

/// A doctor working Mondays 09:00-17:00 UTC.
async fn seed_doctor(client: &Client) -> Ulid {
    let did = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO doctors VALUES ('{did}', 'Dr. Wire', 'UTC', 4500, true)"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO weekly_hours VALUES ('{did}', 'monday', '09:00', '17:00', true)"
        ))
        .await
        .unwrap();
    did
}

fn book_sql(id: Ulid, did: Ulid, start: i64, minutes: u32) -> String {
    let service = Ulid::new();
    let patient = Ulid::new();
    format!("INSERT INTO appointments VALUES ('{id}', '{did}', '{service}', '{patient}', {start}, {minutes})")
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn doctor_round_trip() {
    let addr = start_test_server().await;
    let client = connect(addr, "clinic").await;
    let did = seed_doctor(&client).await;

    let doctors = rows(&client, "SELECT * FROM doctors").await;
    assert_eq!(doctors.len(), 1);
    assert_eq!(doctors[0].get("id"), Some(did.to_string().as_str()));
    assert_eq!(doctors[0].get("timezone"), Some("UTC"));
    assert_eq!(doctors[0].get("consultation_fee"), Some("4500"));

    let hours = rows(&client, &format!("SELECT * FROM weekly_hours WHERE doctor_id = '{did}'")).await;
    assert_eq!(hours.len(), 1);
    assert_eq!(hours[0].get("start_time"), Some("09:00"));
}

#[tokio::test]
async fn booking_then_conflict() {
    let addr = start_test_server().await;
    let client = connect(addr, "clinic").await;
    let did = seed_doctor(&client).await;

    let first = Ulid::new();
    client.batch_execute(&book_sql(first, did, MONDAY + 10 * HOUR, 45)).await.unwrap();

    let code = sqlstate(&client, &book_sql(Ulid::new(), did, MONDAY + 10 * HOUR, 45)).await;
    assert_eq!(code, "23P01");

    let appts = rows(&client, &format!("SELECT * FROM appointments WHERE doctor_id = '{did}'")).await;
    assert_eq!(appts.len(), 1);
    assert_eq!(appts[0].get("id"), Some(first.to_string().as_str()));
    assert_eq!(appts[0].get("status"), Some("scheduled"));
    assert_eq!(appts[0].get("amount"), Some("4500"));
}

#[tokio::test]
async fn policy_rejection_is_p0001() {
    let addr = start_test_server().await;
    let client = connect(addr, "clinic").await;
    let did = seed_doctor(&client).await;

    let code = sqlstate(&client, &book_sql(Ulid::new(), did, MONDAY + 7 * HOUR, 30)).await;
    assert_eq!(code, "P0001");
}

#[tokio::test]
async fn slots_and_availability() {
    let addr = start_test_server().await;
    let client = connect(addr, "clinic").await;
    let did = seed_doctor(&client).await;

    client
        .batch_execute(&format!(
            "INSERT INTO blocked_intervals VALUES ('{}', '{did}', '2026-03-16', '12:00', '13:00', 'lunch')",
            Ulid::new()
        ))
        .await
        .unwrap();

    let free = rows(
        &client,
        &format!("SELECT * FROM availability WHERE doctor_id = '{did}' AND date = '2026-03-16'"),
    )
    .await;
    assert_eq!(free.len(), 2);
    assert_eq!(free[0].get("end"), Some((MONDAY + 12 * HOUR).to_string().as_str()));

    let slots = rows(
        &client,
        &format!(
            "SELECT * FROM slots WHERE doctor_id = '{did}' AND date = '2026-03-16' AND duration = 60 AND granularity = 60"
        ),
    )
    .await;
    // 09-12 and 13-17 in whole hours.
    assert_eq!(slots.len(), 7);

    let first_start: i64 = slots[0].get("start").unwrap().parse().unwrap();
    client.batch_execute(&book_sql(Ulid::new(), did, first_start, 60)).await.unwrap();
    let slots = rows(
        &client,
        &format!(
            "SELECT * FROM slots WHERE doctor_id = '{did}' AND date = '2026-03-16' AND duration = 60 AND granularity = 60"
        ),
    )
    .await;
    assert_eq!(slots.len(), 6);
}

#[tokio::test]
async fn lifecycle_over_wire() {
    let addr = start_test_server().await;
    let client = connect(addr, "clinic").await;
    let did = seed_doctor(&client).await;
    let id = Ulid::new();
    client.batch_execute(&book_sql(id, did, MONDAY + 10 * HOUR, 30)).await.unwrap();

    // Extended protocol with bound text parameters.
    let moved = MONDAY + 14 * HOUR + 30 * MINUTE;
    let n = client
        .execute(
            "INSERT INTO reschedules VALUES ($1, $2)",
            &[&id.to_string(), &moved.to_string()],
        )
        .await
        .unwrap();
    assert_eq!(n, 1);

    client
        .batch_execute(&format!("INSERT INTO status_changes VALUES ('{id}', 'cancelled', 'family emergency')"))
        .await
        .unwrap();

    let appt = rows(&client, &format!("SELECT * FROM appointments WHERE id = '{id}'")).await;
    assert_eq!(appt[0].get("start"), Some(moved.to_string().as_str()));
    assert_eq!(appt[0].get("status"), Some("cancelled"));
    assert_eq!(appt[0].get("cancellation_reason"), Some("family emergency"));

    let code = sqlstate(&client, &format!("INSERT INTO status_changes VALUES ('{id}', 'confirmed')")).await;
    assert_eq!(code, "55000");
}

#[tokio::test]
async fn error_codes() {
    let addr = start_test_server().await;
    let client = connect(addr, "clinic").await;
    let did = seed_doctor(&client).await;

    assert_eq!(sqlstate(&client, "SELEKT 1").await, "42601");
    assert_eq!(
        sqlstate(&client, &format!("INSERT INTO doctors VALUES ('{did}')")).await,
        "23505"
    );
    assert_eq!(
        sqlstate(&client, &format!("INSERT INTO status_changes VALUES ('{}', 'confirmed')", Ulid::new())).await,
        "P0002"
    );
    assert_eq!(
        sqlstate(&client, &format!("INSERT INTO doctors VALUES ('{}', 'x', 'Nowhere/City')", Ulid::new())).await,
        "22023"
    );
    assert_eq!(
        sqlstate(
            &client,
            &format!(
                "SELECT * FROM slots WHERE doctor_id = '{did}' AND date = '2026-03-16' AND duration = 30 AND granularity = {}",
                1i64 << 59
            )
        )
        .await,
        "22023"
    );
    assert_eq!(
        sqlstate(&client, &book_sql(Ulid::new(), did, i64::MAX - 1000, 30)).await,
        "54000"
    );

    // The doctor still answers after the rejected requests.
    client.batch_execute(&book_sql(Ulid::new(), did, MONDAY + 10 * HOUR + 5 * MINUTE, 45)).await.unwrap();
}

#[tokio::test]
async fn databases_are_separate_clinics() {
    let addr = start_test_server().await;
    let north = connect(addr, "north").await;
    let south = connect(addr, "south").await;

    seed_doctor(&north).await;
    assert_eq!(rows(&north, "SELECT * FROM doctors").await.len(), 1);
    assert!(rows(&south, "SELECT * FROM doctors").await.is_empty());
}
