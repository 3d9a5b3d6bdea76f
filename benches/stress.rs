use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

/// Half-hour grid from 09:00 to 17:00.
const SLOTS: [&str; 17] = [
    "09:00", "09:30", "10:00", "10:30", "11:00", "11:30", "12:00", "12:30", "13:00", "13:30",
    "14:00", "14:30", "15:00", "15:30", "16:00", "16:30", "17:00",
];

async fn connect(host: &str, port: u16) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("shop")
        .user("bench")
        .password(std::env::var("SHOPBOOK_PASSWORD").unwrap_or_else(|_| "shopbook".into()));

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
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

fn sqlstate(err: &tokio_postgres::Error) -> String {
    err.as_db_error()
        .map(|db| db.code().code().to_string())
        .unwrap_or_else(|| "-----".into())
}

/// A run's dates start far out and at a random offset so repeated runs
/// against the same data directory rarely share a day.
fn base_date() -> NaiveDate {
    let offset = (Ulid::new().random() % 200_000) as u64;
    NaiveDate::from_ymd_opt(2100, 1, 1)
        .and_then(|d| d.checked_add_days(Days::new(offset)))
        .expect("date in range")
}

fn day(base: NaiveDate, n: u64) -> NaiveDate {
    base.checked_add_days(Days::new(n)).expect("date in range")
}

fn booking_sql(n: usize, date: NaiveDate, time: &str, service: Ulid) -> String {
    format!(
        "INSERT INTO appointments VALUES ('Bench {n}', 'bench{n}@example.ca', '902-555-{:04}', \
         'Honda', 'Civic', 2016, '{date}', '{time}', '{service}', NULL)",
        n % 10_000
    )
}

async fn setup(client: &tokio_postgres::Client) -> Ulid {
    let service = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO services (id, name, duration_minutes) VALUES ('{service}', 'Bench Oil Change', 30)"
        ))
        .await
        .unwrap();
    println!("  created service {service}");
    service
}

async fn phase1_sequential(host: &str, port: u16, service: Ulid, base: NaiveDate) {
    let client = connect(host, port).await;
    let days = 20;
    let n = days * SLOTS.len();
    let mut latencies = Vec::with_capacity(n);
    let mut rejected = 0usize;

    let start = Instant::now();
    for i in 0..n {
        let date = day(base, (i / SLOTS.len()) as u64);
        let sql = booking_sql(i, date, SLOTS[i % SLOTS.len()], service);
        let t = Instant::now();
        if client.simple_query(&sql).await.is_err() {
            rejected += 1;
        }
        latencies.push(t.elapsed());
    }
    let elapsed = start.elapsed();

    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec ({rejected} rejected)", elapsed.as_secs_f64());
    print_latency("booking latency", &mut latencies);
}

/// Many clients race for the same slot; exactly one may win.
async fn phase2_slot_race(host: &str, port: u16, service: Ulid, base: NaiveDate) {
    let contenders = 32;
    let rounds = 10;
    let mut won = 0usize;
    let mut lost = 0usize;
    let mut other = 0usize;
    let mut latencies = Vec::new();

    let mut clients = Vec::with_capacity(contenders);
    for _ in 0..contenders {
        clients.push(connect(host, port).await);
    }
    let clients = std::sync::Arc::new(clients);

    let start = Instant::now();
    for round in 0..rounds {
        let date = day(base, 100 + round as u64);
        let mut handles = Vec::with_capacity(contenders);
        for c in 0..contenders {
            let clients = clients.clone();
            let sql = booking_sql(round * contenders + c, date, "10:00", service);
            handles.push(tokio::spawn(async move {
                let t = Instant::now();
                let result = clients[c].simple_query(&sql).await;
                (result.map(|_| ()).map_err(|e| sqlstate(&e)), t.elapsed())
            }));
        }

        let mut winners = 0;
        for h in handles {
            let (result, latency) = h.await.unwrap();
            latencies.push(latency);
            match result {
                Ok(()) => winners += 1,
                Err(code) if code == "23P01" => lost += 1,
                Err(code) => {
                    eprintln!("  unexpected error {code}");
                    other += 1;
                }
            }
        }
        assert!(winners <= 1, "double booking: {winners} winners on {date}");
        won += winners;
    }
    let elapsed = start.elapsed();

    println!(
        "  {rounds} rounds x {contenders} contenders in {:.2}s: {won} won, {lost} conflicts, {other} other",
        elapsed.as_secs_f64()
    );
    print_latency("contended booking latency", &mut latencies);
}

async fn phase3_read_under_load(host: &str, port: u16, service: Ulid, base: NaiveDate) {
    let writers = 8;
    let duration = Duration::from_secs(5);
    let deadline = Instant::now() + duration;

    let mut writer_handles = Vec::new();
    for w in 0..writers {
        let host = host.to_string();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut i = 0usize;
            let mut count = 0usize;
            while Instant::now() < deadline {
                let date = day(base, 200 + (w * 1000 + i / SLOTS.len()) as u64);
                let sql = booking_sql(i, date, SLOTS[i % SLOTS.len()], service);
                if client.simple_query(&sql).await.is_ok() {
                    count += 1;
                }
                i += 1;
            }
            count
        }));
    }

    let reader = connect(host, port).await;
    let mut latencies = Vec::new();
    let mut open_slots = 0usize;
    let mut r = 0u64;
    while Instant::now() < deadline {
        let date = day(base, 200 + r % 50);
        let t = Instant::now();
        let messages = reader
            .simple_query(&format!(
                "SELECT * FROM availability WHERE date = '{date}' AND service_ids = '{service}'"
            ))
            .await
            .unwrap();
        latencies.push(t.elapsed());
        open_slots += messages
            .iter()
            .filter(|m| matches!(m, SimpleQueryMessage::Row(_)))
            .count();
        r += 1;
    }

    let mut written = 0;
    for h in writer_handles {
        written += h.await.unwrap();
    }
    println!(
        "  {writers} writers booked {written} appointments while reading {} availability lists ({open_slots} open slots seen)",
        latencies.len()
    );
    print_latency("availability latency", &mut latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n = 200;
    let start = Instant::now();
    let mut handles = Vec::with_capacity(n);
    for _ in 0..n {
        let host = host.to_string();
        handles.push(tokio::spawn(async move {
            let t = Instant::now();
            let client = connect(&host, port).await;
            let _ = client.simple_query("SELECT * FROM services").await;
            t.elapsed()
        }));
    }
    let mut latencies = Vec::with_capacity(n);
    for h in handles {
        latencies.push(h.await.unwrap());
    }
    println!(
        "  {n} connect+query in {:.2}s",
        start.elapsed().as_secs_f64()
    );
    print_latency("connect+query latency", &mut latencies);
}

#[tokio::main]
async fn main() {
    let host = std::env::var("SHOPBOOK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("SHOPBOOK_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(5433);

    println!("=== shopbook stress benchmark ===");
    println!("target: {host}:{port}\n");

    let client = connect(&host, port).await;
    println!("[setup]");
    let service = setup(&client).await;
    let base = base_date();
    println!("  booking from {base}");

    println!("\n[phase 1] sequential booking throughput");
    phase1_sequential(&host, port, service, base).await;

    println!("\n[phase 2] contended slot race");
    phase2_slot_race(&host, port, service, base).await;

    println!("\n[phase 3] availability latency under booking load");
    phase3_read_under_load(&host, port, service, base).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
