use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Duration as Days, NaiveDate, Utc};
use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

const MINUTE: i64 = 60_000;
const DAY: i64 = 86_400_000;
/// Doctors work 08:00-20:00 UTC every day: 48 quarter-hour slots.
const SLOTS_PER_DAY: i64 = 48;

async fn connect(host: &str, port: u16, db: &str) -> Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(db)
        .user("medslot")
        .password(std::env::var("MEDSLOT_PASSWORD").unwrap_or_else(|_| "medslot".into()));

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

/// First day at least two days out, so every slot clears the notice window.
fn first_day() -> NaiveDate {
    Utc::now().date_naive() + Days::days(2)
}

fn day_start_ms(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_millis()
}

/// Start of the n-th bookable quarter hour counted from `first_day`.
fn slot_start(n: i64) -> i64 {
    let day = n / SLOTS_PER_DAY;
    let quarter = n % SLOTS_PER_DAY;
    day_start_ms(first_day()) + day * DAY + 8 * 60 * MINUTE + quarter * 15 * MINUTE
}

async fn create_doctor(client: &Client) -> Ulid {
    let did = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO doctors VALUES ('{did}', 'Bench', 'UTC', 1000, true)"))
        .await
        .unwrap();
    let days: Vec<String> = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"]
        .iter()
        .map(|d| format!("('{did}', '{d}', '08:00', '20:00', true)"))
        .collect();
    client
        .batch_execute(&format!("INSERT INTO weekly_hours VALUES {}", days.join(", ")))
        .await
        .unwrap();
    did
}

fn book_sql(did: Ulid, start: i64) -> String {
    format!(
        "INSERT INTO appointments VALUES ('{}', '{did}', '{}', '{}', {start}, 15)",
        Ulid::new(),
        Ulid::new(),
        Ulid::new()
    )
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port, &format!("bench_{}", Ulid::new())).await;
    let did = create_doctor(&client).await;

    let n = 1500;
    let mut latencies = Vec::with_capacity(n as usize);
    let start = Instant::now();
    for i in 0..n {
        let t = Instant::now();
        client.batch_execute(&book_sql(did, slot_start(i))).await.unwrap();
        latencies.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("booking latency", &mut latencies);
}

/// Many patients race for the same handful of slots. Exactly one wins each.
async fn phase2_contention(host: &str, port: u16) {
    let db = format!("bench_{}", Ulid::new());
    let setup = connect(host, port, &db).await;
    let did = create_doctor(&setup).await;

    let n_conns = 50;
    let n_slots = 20;
    let committed = Arc::new(AtomicUsize::new(0));
    let conflicted = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let mut handles = Vec::new();
    for _ in 0..n_conns {
        let host = host.to_string();
        let db = db.clone();
        let committed = committed.clone();
        let conflicted = conflicted.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &db).await;
            for slot in 0..n_slots {
                match client.batch_execute(&book_sql(did, slot_start(slot))).await {
                    Ok(()) => committed.fetch_add(1, Ordering::Relaxed),
                    Err(e) if e.code().map(|c| c.code()) == Some("23P01") => {
                        conflicted.fetch_add(1, Ordering::Relaxed)
                    }
                    Err(e) => panic!("unexpected error: {e}"),
                };
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let won = committed.load(Ordering::Relaxed);
    println!(
        "  {n_conns} patients x {n_slots} slots in {:.2}s: {won} committed, {} conflicted",
        elapsed.as_secs_f64(),
        conflicted.load(Ordering::Relaxed)
    );
    assert_eq!(won, n_slots as usize, "double booking detected");
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let db = format!("bench_{}", Ulid::new());
    let setup = connect(host, port, &db).await;
    let did = create_doctor(&setup).await;
    let date = first_day().format("%Y-%m-%d").to_string();

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let host = host.to_string();
            let db = db.clone();
            tokio::spawn(async move {
                let client = connect(&host, port, &db).await;
                // Writers stay off day 0 so the reader's slot list stays stable in size.
                for i in 0..300 {
                    let n = SLOTS_PER_DAY + w * 300 + i;
                    let _ = client.batch_execute(&book_sql(did, slot_start(n))).await;
                }
            })
        })
        .collect();

    let reader = connect(host, port, &db).await;
    let sql = format!("SELECT * FROM slots WHERE doctor_id = '{did}' AND date = '{date}' AND duration = 30");
    let mut latencies = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline && !writers.iter().all(|w| w.is_finished()) {
        let t = Instant::now();
        reader.simple_query(&sql).await.unwrap();
        latencies.push(t.elapsed());
    }
    for w in writers {
        w.await.unwrap();
    }
    print_latency("slot query latency", &mut latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 100;
    let success = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let mut handles = Vec::new();
    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, "bench_storm").await;
            let did = create_doctor(&client).await;
            for i in 0..10 {
                client.batch_execute(&book_sql(did, slot_start(i))).await.unwrap();
            }
            client.simple_query("SELECT * FROM doctors").await.unwrap();
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    println!(
        "  {n_conns} connections: {}/{n_conns} succeeded in {:.2}s",
        success.load(Ordering::Relaxed),
        start.elapsed().as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("MEDSLOT_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("MEDSLOT_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid MEDSLOT_PORT");

    println!("=== medslot booking storm ===");
    println!("target: {host}:{port}\n");

    // Each phase uses its own clinic database to avoid interference.

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contended slots");
    phase2_contention(&host, port).await;

    println!("\n[phase 3] slot query latency under booking load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
