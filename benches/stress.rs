use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

struct Target {
    host: String,
    port: u16,
    admin: String,
    password: String,
}

async fn connect(target: &Target, user: &str) -> Client {
    let mut config = Config::new();
    config
        .host(&target.host)
        .port(target.port)
        .dbname("lotledger")
        .user(user)
        .password(&target.password);

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

// ── Fixtures ─────────────────────────────────────────────────

async fn create_lot(admin: &Client, capacity: u32) -> Ulid {
    let id = Ulid::new();
    admin
        .batch_execute(&format!(
            "INSERT INTO lots (id, name, address, pin_code, hourly_rate, capacity) \
             VALUES ('{id}', 'Bench {id}', 'Benchmark Avenue {id}', '560001', 40, {capacity})"
        ))
        .await
        .unwrap();
    id
}

/// Register a fresh user and log in as them.
async fn new_user(target: &Target, admin: &Client) -> Client {
    let id = Ulid::new();
    let username = format!("bench_{}", id.to_string().to_lowercase());
    admin
        .batch_execute(&format!(
            "INSERT INTO users (id, username) VALUES ('{id}', '{username}')"
        ))
        .await
        .unwrap();
    connect(target, &username).await
}

/// Reserve a spot, returning the reservation id, or None when the lot is full.
async fn reserve(client: &Client, lot: Ulid) -> Option<String> {
    let rid = Ulid::new();
    let msgs = client
        .simple_query(&format!(
            "INSERT INTO reservations (id, lot_id, vehicle_number) VALUES ('{rid}', '{lot}', 'BENCH01')"
        ))
        .await
        .ok()?;
    msgs.iter().find_map(|m| match m {
        SimpleQueryMessage::Row(_) => Some(rid.to_string()),
        _ => None,
    })
}

async fn release(client: &Client, rid: &str) {
    client
        .batch_execute(&format!(
            "UPDATE reservations SET status = 'completed' WHERE id = '{rid}'"
        ))
        .await
        .unwrap();
}

// ── Phases ───────────────────────────────────────────────────

async fn phase1_sequential(target: &Target, admin: &Client) {
    let lot = create_lot(admin, 10).await;
    let client = new_user(target, admin).await;

    let n = 1000;
    let mut latencies = Vec::with_capacity(n * 2);
    let start = Instant::now();

    for _ in 0..n {
        let t = Instant::now();
        let rid = reserve(&client, lot).await.expect("reserve failed");
        latencies.push(t.elapsed());
        let t = Instant::now();
        release(&client, &rid).await;
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = (n * 2) as f64 / elapsed.as_secs_f64();
    println!("  {n} reserve/release cycles in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent(target: &Arc<Target>, admin: &Client) {
    let n_tasks = 20;
    let n_per_task = 100;
    // fewer spots than drivers, so some reserves must be refused
    let lot = create_lot(admin, 8).await;

    let mut clients = Vec::with_capacity(n_tasks);
    for _ in 0..n_tasks {
        clients.push(new_user(target, admin).await);
    }

    let refused = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();
    for client in clients {
        let refused = refused.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..n_per_task {
                match reserve(&client, lot).await {
                    Some(rid) => release(&client, &rid).await,
                    None => {
                        refused.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} drivers x {n_per_task} attempts on 8 spots = {total} in {:.2}s = {ops:.0} attempts/sec, {} refused",
        elapsed.as_secs_f64(),
        refused.load(Ordering::Relaxed)
    );
}

async fn phase3_read_under_load(target: &Arc<Target>, admin: &Client) {
    let lot = create_lot(admin, 50).await;

    // Writers churn reservations on the same lot the readers query
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let client = new_user(target, admin).await;
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            while !stop.load(Ordering::Relaxed) {
                if let Some(rid) = reserve(&client, lot).await {
                    release(&client, &rid).await;
                }
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for _ in 0..n_readers {
        let client = new_user(target, admin).await;
        reader_handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .batch_execute(&format!("SELECT * FROM spots WHERE lot_id = '{lot}'"))
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

    print_latency("spot listing", &mut all_latencies);
}

async fn phase4_last_spot(target: &Arc<Target>, admin: &Client) {
    let rounds = 50;
    let racers = 8;
    let mut violations = 0;
    let mut latencies = Vec::new();

    for _ in 0..rounds {
        let lot = create_lot(admin, 1).await;
        let mut clients = Vec::with_capacity(racers);
        for _ in 0..racers {
            clients.push(new_user(target, admin).await);
        }
        let handles: Vec<_> = clients
            .into_iter()
            .map(|client| {
                tokio::spawn(async move {
                    let t = Instant::now();
                    let won = reserve(&client, lot).await.is_some();
                    (won, t.elapsed())
                })
            })
            .collect();

        let mut winners = 0;
        for h in handles {
            let (won, took) = h.await.unwrap();
            winners += usize::from(won);
            latencies.push(took);
        }
        if winners != 1 {
            violations += 1;
        }
    }

    println!("  {rounds} rounds x {racers} racers on a single spot: {violations} rounds without exactly one winner");
    print_latency("contended reserve", &mut latencies);
}

async fn phase5_connection_storm(target: &Arc<Target>, admin: &Client) {
    let n_conns = 50;
    let ops_per_conn = 10;
    let lot = create_lot(admin, 60).await;

    let mut clients = Vec::with_capacity(n_conns);
    for _ in 0..n_conns {
        clients.push(new_user(target, admin).await);
    }

    let start = Instant::now();
    let success = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for client in clients {
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..ops_per_conn {
                if let Some(rid) = reserve(&client, lot).await {
                    release(&client, &rid).await;
                }
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} cycles each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let env = |k: &str, d: &str| std::env::var(k).unwrap_or_else(|_| d.into());
    let target = Arc::new(Target {
        host: env("LOTLEDGER_HOST", "127.0.0.1"),
        port: env("LOTLEDGER_PORT", "5433")
            .parse()
            .expect("invalid LOTLEDGER_PORT"),
        admin: env("LOTLEDGER_ADMIN_USER", "admin"),
        password: env("LOTLEDGER_PASSWORD", "lotledger"),
    });

    println!("=== lotledger stress benchmark ===");
    println!("target: {}:{}\n", target.host, target.port);

    let admin = connect(&target, &target.admin).await;

    println!("[phase 1] sequential reserve/release");
    phase1_sequential(&target, &admin).await;

    println!("\n[phase 2] concurrent drivers on a small lot");
    phase2_concurrent(&target, &admin).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&target, &admin).await;

    println!("\n[phase 4] last-spot contention");
    phase4_last_spot(&target, &admin).await;

    println!("\n[phase 5] connection storm");
    phase5_connection_storm(&target, &admin).await;

    println!("\n=== done ===");
}
