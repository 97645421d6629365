use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use spotbook::auth::{self, SpotbookAuthSource};
use spotbook::tenant::TenantManager;
use spotbook::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server(users: HashMap<String, String>) -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("spotbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000));
    let auth_source = SpotbookAuthSource::new("spotbook".to_string(), users);

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            let auth = auth_source.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, auth, None).await;
            });
        }
    });

    (addr, tm)
}

async fn try_connect(
    addr: SocketAddr,
    db: &str,
    user: &str,
    password: &str,
) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(db)
        .user(user)
        .password(password);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr, user: &str) -> Client {
    try_connect(addr, "camp", user, "spotbook").await.unwrap()
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> &str {
    err.code().map(|c| c.code()).unwrap_or("")
}

async fn create_listing(client: &Client, spots: u32, max_guests: u32) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO listings (id, name, total_spots, max_guests, price_per_night) VALUES ('{id}', 'Site {id}', {spots}, {max_guests}, 2500)"
        ))
        .await
        .unwrap();
    id
}

fn book_sql(listing: Ulid, check_in: &str, check_out: &str, guests: u32) -> String {
    format!(
        "INSERT INTO bookings (listing_id, check_in, check_out, guests) VALUES ('{listing}', '{check_in}', '{check_out}', {guests}) RETURNING *"
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn create_and_list_listings() {
    let (addr, _tm) = start_test_server(HashMap::new()).await;
    let client = connect(addr, "owner").await;

    let id = create_listing(&client, 4, 6).await;
    let listed = rows(&client, "SELECT * FROM listings").await;

    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("id"), Some(id.to_string().as_str()));
    assert_eq!(listed[0].get("total_spots"), Some("4"));
    assert_eq!(listed[0].get("max_guests"), Some("6"));
}

#[tokio::test]
async fn book_until_full_over_the_wire() {
    let (addr, _tm) = start_test_server(HashMap::new()).await;
    let alice = connect(addr, "alice").await;
    let bob = connect(addr, "bob").await;
    let carol = connect(addr, "carol").await;
    let lid = create_listing(&alice, 2, 4).await;

    let booked = rows(&alice, &book_sql(lid, "2024-01-01", "2024-01-02", 1)).await;
    assert_eq!(booked[0].get("user_id"), Some("alice"));
    assert_eq!(booked[0].get("status"), Some("confirmed"));
    rows(&bob, &book_sql(lid, "2024-01-01", "2024-01-02", 1)).await;

    let err = carol
        .simple_query(&book_sql(lid, "2024-01-01", "2024-01-02", 1))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "23P01");

    let nights = rows(
        &carol,
        &format!(
            "SELECT * FROM availability WHERE listing_id = '{lid}' AND day >= '2023-12-31' AND day <= '2024-01-02'"
        ),
    )
    .await;
    let remaining: Vec<Option<&str>> = nights.iter().map(|r| r.get("remaining")).collect();
    assert_eq!(remaining, vec![Some("2"), Some("0"), Some("0")]);
}

#[tokio::test]
async fn guest_limit_and_bad_input_codes() {
    let (addr, _tm) = start_test_server(HashMap::new()).await;
    let client = connect(addr, "alice").await;
    let lid = create_listing(&client, 2, 2).await;

    let err = client
        .simple_query(&book_sql(lid, "2024-02-01", "2024-02-02", 3))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "23514");

    let err = client
        .simple_query(&book_sql(lid, "2024-02-05", "2024-02-01", 1))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "22023");

    let err = client
        .simple_query(&book_sql(Ulid::new(), "2024-02-01", "2024-02-01", 1))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "P0002");

    let err = client.simple_query("SELECT * FROM holds").await.unwrap_err();
    assert_eq!(sqlstate(&err), "42601");
}

#[tokio::test]
async fn bookings_are_scoped_to_the_login_user() {
    let (addr, _tm) = start_test_server(HashMap::new()).await;
    let alice = connect(addr, "alice").await;
    let bob = connect(addr, "bob").await;
    let lid = create_listing(&alice, 3, 2).await;

    let booked = rows(&alice, &book_sql(lid, "2024-03-01", "2024-03-03", 2)).await;
    let booking_id = booked[0].get("id").unwrap().to_string();

    assert_eq!(rows(&alice, "SELECT * FROM bookings").await.len(), 1);
    assert!(rows(&bob, "SELECT * FROM bookings").await.is_empty());

    let err = bob
        .simple_query(&format!("DELETE FROM bookings WHERE id = '{booking_id}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "42501");

    let cancelled = rows(
        &alice,
        &format!("DELETE FROM bookings WHERE id = '{booking_id}' RETURNING *"),
    )
    .await;
    assert_eq!(cancelled[0].get("status"), Some("cancelled"));

    let err = alice
        .simple_query(&format!("DELETE FROM bookings WHERE id = '{booking_id}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "55000");

    // The soft-deleted booking is still listed
    let mine = rows(&alice, "SELECT * FROM bookings").await;
    assert_eq!(mine[0].get("status"), Some("cancelled"));
}

#[tokio::test]
async fn delete_listing_over_the_wire() {
    let (addr, _tm) = start_test_server(HashMap::new()).await;
    let client = connect(addr, "alice").await;
    let lid = create_listing(&client, 1, 1).await;
    rows(&client, &book_sql(lid, "2024-04-01", "2024-04-01", 1)).await;

    let err = client
        .simple_query(&format!("DELETE FROM listings WHERE id = '{lid}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "2BP01");

    let other = create_listing(&client, 1, 1).await;
    client
        .batch_execute(&format!("DELETE FROM listings WHERE id = '{other}'"))
        .await
        .unwrap();
    assert_eq!(rows(&client, "SELECT * FROM listings").await.len(), 1);
}

#[tokio::test]
async fn only_the_host_deletes_a_listing() {
    let (addr, _tm) = start_test_server(HashMap::new()).await;
    let alice = connect(addr, "alice").await;
    let bob = connect(addr, "bob").await;
    let lid = create_listing(&alice, 1, 1).await;

    let listed = rows(&bob, "SELECT * FROM listings").await;
    assert_eq!(listed[0].get("host"), Some("alice"));

    let err = bob
        .simple_query(&format!("DELETE FROM listings WHERE id = '{lid}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "42501");

    alice
        .batch_execute(&format!("DELETE FROM listings WHERE id = '{lid}'"))
        .await
        .unwrap();
    assert!(rows(&bob, "SELECT * FROM listings").await.is_empty());
}

#[tokio::test]
async fn extended_protocol_binds_text_params() {
    let (addr, _tm) = start_test_server(HashMap::new()).await;
    let client = connect(addr, "alice").await;
    let lid = Ulid::new().to_string();

    let inserted = client
        .execute(
            "INSERT INTO listings (id, name, total_spots, max_guests, price_per_night) VALUES ($1, $2, $3, $4, $5)",
            &[&lid, &"Bob's Meadow", &"1", &"2", &"1000"],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    client
        .execute(
            "INSERT INTO bookings (listing_id, check_in, check_out, guests) VALUES ($1, $2, $3, $4)",
            &[&lid, &"2024-05-01", &"2024-05-02", &"2"],
        )
        .await
        .unwrap();

    let err = client
        .execute(
            "INSERT INTO bookings (listing_id, check_in, check_out, guests) VALUES ($1, $2, $3, $4)",
            &[&lid, &"2024-05-02", &"2024-05-03", &"1"],
        )
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "23P01");

    let listed = rows(&client, "SELECT * FROM listings").await;
    assert_eq!(listed[0].get("name"), Some("Bob's Meadow"));

    // A bound value that looks like a placeholder stays as written
    let other = Ulid::new().to_string();
    client
        .execute(
            "INSERT INTO listings (id, name, total_spots, max_guests, price_per_night) VALUES ($1, $2, $3, $4, $5)",
            &[&other, &"Loop $1", &"1", &"2", &"1000"],
        )
        .await
        .unwrap();
    let names: Vec<String> = rows(&client, "SELECT * FROM listings")
        .await
        .iter()
        .filter_map(|r| r.get("name").map(str::to_string))
        .collect();
    assert!(names.contains(&"Loop $1".to_string()));
}

#[tokio::test]
async fn tenants_are_isolated_by_database() {
    let (addr, tm) = start_test_server(HashMap::new()).await;
    let a = try_connect(addr, "north", "alice", "spotbook").await.unwrap();
    let b = try_connect(addr, "south", "alice", "spotbook").await.unwrap();

    create_listing(&a, 1, 1).await;
    assert!(rows(&b, "SELECT * FROM listings").await.is_empty());
    assert_eq!(tm.len(), 2);
}

#[tokio::test]
async fn per_user_passwords() {
    let (addr, _tm) = start_test_server(auth::parse_users("alice:a1,bob:b2")).await;

    assert!(try_connect(addr, "camp", "alice", "a1").await.is_ok());
    assert!(try_connect(addr, "camp", "alice", "b2").await.is_err());
    assert!(try_connect(addr, "camp", "mallory", "spotbook").await.is_err());
}
