use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use tokio_postgres::error::SqlState;
use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

async fn connect(host: &str, port: u16, user: &str, password: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config.host(host).port(port).dbname("slotbook").user(user).password(password);

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

/// Days far enough in the future that nothing is elapsed or past, offset per
/// run so repeated runs against the same server don't collide.
struct Calendar {
    base: NaiveDate,
}

impl Calendar {
    fn new() -> Self {
        let offset = (Ulid::new().random() % 300_000) as u64;
        let base = NaiveDate::from_ymd_opt(2100, 1, 1).expect("valid date") + Days::new(offset);
        Self { base }
    }

    fn day(&self, n: u64) -> String {
        (self.base + Days::new(n)).to_string()
    }
}

/// The default 09:00-19:00 grid in 30-minute steps.
fn grid() -> Vec<String> {
    (0..20).map(|i| format!("{:02}:{:02}", 9 + i / 2, (i % 2) * 30)).collect()
}

fn insert_sql(date: &str, time: &str, n: usize) -> String {
    format!(
        "INSERT INTO reservations (name, phone, service, date, time) \
         VALUES ('Bench {n}', '0555{n:07}', 'Haircut', '{date}', '{time}')"
    )
}

async fn phase1_sequential(host: &str, port: u16, auth: (&str, &str), cal: &Calendar) {
    let client = connect(host, port, auth.0, auth.1).await;
    let slots = grid();

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let date = cal.day((i / slots.len()) as u64);
        let time = &slots[i % slots.len()];
        let t = Instant::now();
        client.batch_execute(&insert_sql(&date, time, i)).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} reservations in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Many clients race for the same slots; each slot must have exactly one winner.
async fn phase2_same_slot_contention(host: &str, port: u16, auth: (&str, &str), cal: &Calendar) {
    let n_tasks = 16;
    let slots = grid();
    let date = cal.day(1000);

    let wins = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for task in 0..n_tasks {
        let host = host.to_string();
        let (user, password) = (auth.0.to_string(), auth.1.to_string());
        let date = date.clone();
        let slots = slots.clone();
        let wins = wins.clone();
        let conflicts = conflicts.clone();

        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &user, &password).await;
            for time in &slots {
                match client.batch_execute(&insert_sql(&date, time, task)).await {
                    Ok(()) => {
                        wins.fetch_add(1, Ordering::Relaxed);
                    }
                    // Once the day is full the capacity check answers first.
                    Err(e)
                        if e.code() == Some(&SqlState::UNIQUE_VIOLATION)
                            || e.code() == Some(&SqlState::CONFIGURATION_LIMIT_EXCEEDED) =>
                    {
                        conflicts.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let wins = wins.load(Ordering::Relaxed);
    let conflicts = conflicts.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} clients x {} slots in {:.2}s: {wins} booked, {conflicts} conflicts",
        slots.len(),
        elapsed.as_secs_f64()
    );
    assert_eq!(wins, slots.len(), "every slot must be booked exactly once");
}

async fn phase3_read_under_load(host: &str, port: u16, auth: (&str, &str), cal: &Calendar) {
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();

    for w in 0..4u64 {
        let host = host.to_string();
        let (user, password) = (auth.0.to_string(), auth.1.to_string());
        let stop = stop.clone();
        let days: Vec<String> = (0..500).map(|d| cal.day(2000 + w * 1000 + d)).collect();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &user, &password).await;
            let slots = grid();
            let mut i = 0usize;
            while !stop.load(Ordering::Relaxed) && i < days.len() * slots.len() {
                let date = &days[i / slots.len()];
                let _ = client.batch_execute(&insert_sql(date, &slots[i % slots.len()], i)).await;
                i += 1;
            }
        }));
    }

    let n_readers = 8;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();

    for r in 0..n_readers {
        let host = host.to_string();
        let (user, password) = (auth.0.to_string(), auth.1.to_string());
        let date = cal.day(2000 + (r % 4) * 1000);
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &user, &password).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .simple_query(&format!("SELECT * FROM slots WHERE date = '{date}'"))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("slots query", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16, auth: (&str, &str), cal: &Calendar) {
    let n_conns = 50;
    let start = Instant::now();
    let success = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for c in 0..n_conns {
        let host = host.to_string();
        let (user, password) = (auth.0.to_string(), auth.1.to_string());
        let success = success.clone();
        let date = cal.day(10_000 + c as u64);
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &user, &password).await;
            for (i, time) in grid().iter().take(10).enumerate() {
                client.batch_execute(&insert_sql(&date, time, i)).await.unwrap();
            }
            client.simple_query("SELECT * FROM stats").await.unwrap();
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, 10 reservations each: {ok}/{n_conns} succeeded in {:.2}s",
        start.elapsed().as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("SLOTBOOK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("SLOTBOOK_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid SLOTBOOK_PORT");
    let user = std::env::var("SLOTBOOK_USER").unwrap_or_else(|_| "admin".into());
    let password = std::env::var("SLOTBOOK_PASSWORD").unwrap_or_else(|_| "slotbook".into());
    let auth = (user.as_str(), password.as_str());

    println!("=== slotbook stress benchmark ===");
    println!("target: {host}:{port}\n");
    println!("expects the default schedule (09:00-19:00, 30 min slots, capacity 20)\n");

    let cal = Calendar::new();

    println!("[phase 1] sequential write throughput");
    phase1_sequential(&host, port, auth, &cal).await;

    println!("\n[phase 2] same-slot contention");
    phase2_same_slot_contention(&host, port, auth, &cal).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&host, port, auth, &cal).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port, auth, &cal).await;

    println!("\n=== done ===");
}
