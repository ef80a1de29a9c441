use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use meetbook::catalog::InMemoryCatalog;
use meetbook::model::RoomInfo;
use meetbook::service::BookingService;
use meetbook::wire;

const HOUR: i64 = 3_600_000;
/// 2030-01-01T00:00:00Z
const EPOCH: i64 = 1_893_456_000_000;

async fn start_server(rooms: &[Ulid], workers: usize) -> SocketAddr {
    let catalog = InMemoryCatalog::new();
    for (i, &id) in rooms.iter().enumerate() {
        catalog.insert_room(RoomInfo {
            id,
            name: format!("room {i}"),
            kind: "small".into(),
            capacity: 20,
            hourly_rate: Decimal::from(100_000),
            image_path: String::new(),
        });
    }
    let catalog = Arc::new(catalog);
    let config = meetbook::config::Config {
        data_dir: std::env::temp_dir().join(format!("meetbook_bench_{}", Ulid::new())),
        workers,
        ..meetbook::config::Config::default()
    };
    let service = BookingService::start(&config, catalog.clone(), catalog).expect("start service");
    let admins = Arc::new(HashSet::new());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let service = service.clone();
            let admins = admins.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, service, "meetbook".into(), admins, None).await;
            });
        }
    });
    addr
}

async fn connect(addr: SocketAddr, user: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("meetbook")
        .user(user)
        .password("meetbook");

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

fn submit_sql(user: &str, room: Ulid, slot: i64) -> String {
    let start = EPOCH + slot * HOUR;
    let end = start + HOUR;
    format!(
        "INSERT INTO booking_requests (user_id, name, room_id, start_time, end_time, participants) \
         VALUES ('{user}', 'Bench', '{room}', {start}, {end}, 4)"
    )
}

fn first_value(messages: &[SimpleQueryMessage], column: &str) -> Option<String> {
    messages.iter().find_map(|m| match m {
        SimpleQueryMessage::Row(row) => row.get(column).map(str::to_string),
        _ => None,
    })
}

/// Submit and poll until settled. Returns the outcome label.
async fn submit_and_settle(client: &tokio_postgres::Client, sql: &str) -> String {
    let messages = client.simple_query(sql).await.expect("submit");
    let id = first_value(&messages, "id").expect("submission id");
    loop {
        let messages = client
            .simple_query(&format!("SELECT * FROM submissions WHERE id = '{id}'"))
            .await
            .expect("status");
        match first_value(&messages, "status") {
            Some(status) if status != "queued" => return status,
            _ => tokio::time::sleep(Duration::from_millis(1)).await,
        }
    }
}

async fn phase1_sequential(addr: SocketAddr, room: Ulid) {
    let client = connect(addr, "seq").await;
    let n = 1000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        let outcome = submit_and_settle(&client, &submit_sql("seq", room, i as i64)).await;
        assert_eq!(outcome, "committed");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("submit-to-commit latency", &mut latencies);
}

async fn phase2_concurrent(addr: SocketAddr, rooms: &[Ulid]) {
    let n_tasks = 10;
    let n_per_task = 200;
    let start = Instant::now();
    let mut handles = Vec::new();

    for t in 0..n_tasks {
        let room = rooms[t % rooms.len()];
        handles.push(tokio::spawn(async move {
            let user = format!("writer{t}");
            let client = connect(addr, &user).await;
            let mut committed = 0;
            for j in 0..n_per_task {
                // Tasks sharing a room use disjoint slots.
                let slot = 10_000 + (t as i64) * n_per_task + j;
                if submit_and_settle(&client, &submit_sql(&user, room, slot)).await == "committed" {
                    committed += 1;
                }
            }
            committed
        }));
    }

    let mut committed = 0;
    for h in handles {
        committed += h.await.expect("writer task");
    }
    let elapsed = start.elapsed();
    let total = n_tasks as i64 * n_per_task;
    println!(
        "  {n_tasks} tasks x {n_per_task} bookings = {total} total ({committed} committed) in {:.2}s = {:.0} ops/sec",
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64()
    );
}

async fn phase3_contention(addr: SocketAddr, room: Ulid) {
    let rounds = 50;
    let contenders = 8;
    let start = Instant::now();
    let mut double_booked = 0;

    for round in 0..rounds {
        let mut handles = Vec::new();
        for c in 0..contenders {
            handles.push(tokio::spawn(async move {
                let user = format!("racer{c}");
                let client = connect(addr, &user).await;
                submit_and_settle(&client, &submit_sql(&user, room, 50_000 + round)).await
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.expect("racer task") == "committed" {
                winners += 1;
            }
        }
        if winners != 1 {
            double_booked += 1;
        }
    }

    println!(
        "  {rounds} rounds x {contenders} contenders in {:.2}s, {double_booked} rounds without exactly one winner",
        start.elapsed().as_secs_f64()
    );
}

async fn phase4_reads_under_load(addr: SocketAddr) {
    let n_readers = 10;
    let reads_per_reader = 300;
    let mut handles = Vec::new();

    for r in 0..n_readers {
        handles.push(tokio::spawn(async move {
            let client = connect(addr, &format!("writer{r}")).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .simple_query("SELECT * FROM bookings WHERE page = 1 AND page_size = 20")
                    .await
                    .expect("history");
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in handles {
        all.extend(h.await.expect("reader task"));
    }
    print_latency("history query", &mut all);
}

#[tokio::main]
async fn main() {
    let workers: usize = std::env::var("MEETBOOK_WORKERS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(4);
    let rooms: Vec<Ulid> = (0..10).map(|_| Ulid::new()).collect();
    let addr = start_server(&rooms, workers).await;

    println!("=== meetbook stress benchmark ===");
    println!("in-process server on {addr}, {workers} workers\n");

    println!("[phase 1] sequential submit-to-commit");
    phase1_sequential(addr, rooms[0]).await;

    println!("\n[phase 2] concurrent submissions");
    phase2_concurrent(addr, &rooms).await;

    println!("\n[phase 3] contention on one slot");
    phase3_contention(addr, rooms[1]).await;

    println!("\n[phase 4] read latency");
    phase4_reads_under_load(addr).await;

    println!("\n=== done ===");
}
