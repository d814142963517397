//! Prefix tree test driver
//!
//! Runs the basic, reorganization, types, incr, and concurrent-readers
//! suites against both allocator variants. Exits 0 iff every suite passes.
//!
//! The concurrent-readers suite re-executes this binary with a hidden
//! `reader` subcommand to spawn its reader processes.

use clap::{Parser, Subcommand};
use shmstructs::{
    Allocator, Error, LogarithmicAllocator, Pool, PrefixTree, SimpleAllocator, Value, ValueType,
};
use std::collections::HashMap;
use std::process::Command;
use std::rc::Rc;
use std::time::{Duration, Instant};

const POOL_NAME: &str = "shmstructs-test-table";

#[derive(Parser)]
#[command(name = "structures_test")]
#[command(about = "Shared structures test driver", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll key1 as a reader process (spawned by the concurrent suite)
    #[command(hide = true)]
    Reader {
        /// Pool to attach to
        #[arg(long)]
        pool: String,

        /// Allocator variant backing the pool
        #[arg(long)]
        allocator: String,
    },
}

type TestResult = Result<(), String>;

macro_rules! check {
    ($cond:expr) => {
        if !$cond {
            return Err(format!(
                "{}:{}: {} failed",
                file!(),
                line!(),
                stringify!($cond)
            ));
        }
    };
}

macro_rules! check_eq {
    ($left:expr, $right:expr) => {{
        let (l, r) = (&$left, &$right);
        if l != r {
            return Err(format!(
                "{}:{}: {} != {} ({:?} vs {:?})",
                file!(),
                line!(),
                stringify!($left),
                stringify!($right),
                l,
                r
            ));
        }
    }};
}

fn create_allocator(pool: Rc<Pool>, kind: &str) -> Result<Rc<dyn Allocator>, String> {
    match kind {
        "simple" => Ok(Rc::new(
            SimpleAllocator::attach(pool).map_err(|e| e.to_string())?,
        )),
        "logarithmic" => Ok(Rc::new(
            LogarithmicAllocator::attach(pool).map_err(|e| e.to_string())?,
        )),
        other => Err(format!("unknown allocator type: {other}")),
    }
}

fn get_or_create_tree(name: &str, kind: &str) -> Result<PrefixTree, String> {
    let pool = Rc::new(Pool::open(name, 0, false).map_err(|e| e.to_string())?);
    let allocator = create_allocator(pool, kind)?;
    PrefixTree::attach(allocator, 0).map_err(|e| e.to_string())
}

/// Compare the whole observable state of the tree against an expected map,
/// including iteration order and completeness.
fn verify_state(
    expected: &HashMap<Vec<u8>, Value>,
    tree: &PrefixTree,
    expected_node_size: u64,
) -> TestResult {
    check_eq!(tree.len(), expected.len() as u64);
    check_eq!(tree.node_size(), expected_node_size);
    for (key, value) in expected {
        check_eq!(tree.at(key).map_err(|e| e.to_string())?, *value);
    }

    let mut missing = expected.clone();
    let mut last_key: Option<Vec<u8>> = None;
    for (key, value) in tree.iter() {
        if let Some(prev) = &last_key {
            check!(key > *prev);
        }
        match missing.remove(&key) {
            Some(expect) => check_eq!(value, expect),
            None => return Err(format!("iteration produced unexpected key {key:?}")),
        }
        last_key = Some(key);
    }
    check!(missing.is_empty());
    Ok(())
}

fn run_basic_test(kind: &str) -> TestResult {
    println!("[{kind}] -- basic");

    let tree = get_or_create_tree(POOL_NAME, kind)?;
    let initial_allocated = tree.allocator().bytes_allocated();
    check_eq!(tree.len(), 0);

    tree.insert(b"key1", "value1".into()).map_err(|e| e.to_string())?;
    check_eq!((tree.len(), tree.node_size()), (1, 4));
    tree.insert(b"key2", "value2".into()).map_err(|e| e.to_string())?;
    check_eq!((tree.len(), tree.node_size()), (2, 4));
    tree.insert(b"key3", "value3".into()).map_err(|e| e.to_string())?;
    check_eq!((tree.len(), tree.node_size()), (3, 4));

    check_eq!(tree.at(b"key1").map_err(|e| e.to_string())?, Value::from("value1"));
    check_eq!(tree.at(b"key2").map_err(|e| e.to_string())?, Value::from("value2"));
    check_eq!(tree.at(b"key3").map_err(|e| e.to_string())?, Value::from("value3"));

    check!(tree.erase(b"key2"));
    check_eq!((tree.len(), tree.node_size()), (2, 4));
    check!(!tree.erase(b"key2"));
    check_eq!((tree.len(), tree.node_size()), (2, 4));
    check!(matches!(tree.at(b"key2"), Err(Error::KeyNotFound)));

    tree.insert(b"key1", "value0".into()).map_err(|e| e.to_string())?;
    check_eq!((tree.len(), tree.node_size()), (2, 4));
    check_eq!(tree.at(b"key1").map_err(|e| e.to_string())?, Value::from("value0"));

    check!(tree.erase(b"key1"));
    check_eq!((tree.len(), tree.node_size()), (1, 4));
    check!(tree.erase(b"key3"));
    check_eq!((tree.len(), tree.node_size()), (0, 1));

    // The empty table must not leak any allocated memory.
    check_eq!(initial_allocated, tree.allocator().bytes_allocated());
    Ok(())
}

fn run_reorganization_test(kind: &str) -> TestResult {
    println!("[{kind}] -- reorganization");

    let tree = get_or_create_tree(POOL_NAME, kind)?;
    let initial_allocated = tree.allocator().bytes_allocated();
    let mut expected: HashMap<Vec<u8>, Value> = HashMap::new();
    verify_state(&expected, &tree, 1)?;

    let inserts: [(&[u8], u64); 7] = [
        (b"abc", 3),
        (b"ab", 3),
        // erase "abc" happens between these; see below
        (b"", 2),
        (b"abcd", 4),
        (b"abcde", 5),
        (b"abcdf", 5),
        (b"abce", 5),
    ];

    // insert "abc", insert "ab"
    for &(key, node_size) in &inserts[..2] {
        tree.insert(key, Value::from(key)).map_err(|e| e.to_string())?;
        expected.insert(key.to_vec(), Value::from(key));
        verify_state(&expected, &tree, node_size)?;
    }

    // erase "abc": the value of "ab" moves back into its parent's slot
    check!(tree.erase(b"abc"));
    expected.remove(b"abc".as_slice());
    verify_state(&expected, &tree, 2)?;

    // insert "", insert "abcd"
    for &(key, node_size) in &inserts[2..4] {
        tree.insert(key, Value::from(key)).map_err(|e| e.to_string())?;
        expected.insert(key.to_vec(), Value::from(key));
        verify_state(&expected, &tree, node_size)?;
    }

    // erase "ab": the chain to "abcd" stays
    check!(tree.erase(b"ab"));
    expected.remove(b"ab".as_slice());
    verify_state(&expected, &tree, 4)?;

    // insert "abcde", "abcdf", "abce"
    for &(key, node_size) in &inserts[4..] {
        tree.insert(key, Value::from(key)).map_err(|e| e.to_string())?;
        expected.insert(key.to_vec(), Value::from(key));
        verify_state(&expected, &tree, node_size)?;
    }

    // insert "abcef": "abce" gets promoted into a node of its own
    tree.insert(b"abcef", Value::from(b"abcef".as_slice()))
        .map_err(|e| e.to_string())?;
    expected.insert(b"abcef".to_vec(), Value::from(b"abcef".as_slice()));
    verify_state(&expected, &tree, 6)?;

    tree.clear().map_err(|e| e.to_string())?;
    expected.clear();
    verify_state(&expected, &tree, 1)?;

    check_eq!(initial_allocated, tree.allocator().bytes_allocated());
    Ok(())
}

fn run_types_test(kind: &str) -> TestResult {
    println!("[{kind}] -- types");

    let tree = get_or_create_tree(POOL_NAME, kind)?;
    let initial_allocated = tree.allocator().bytes_allocated();

    check_eq!(tree.len(), 0);
    check_eq!(tree.node_size(), 1);

    // Write a bunch of keys of different types.
    tree.insert(b"key-string", "value-string".into()).map_err(|e| e.to_string())?;
    tree.insert(b"key-int", Value::Int(1024 * 1024 * -3)).map_err(|e| e.to_string())?;
    tree.insert(b"key-int-long", Value::Int(0x9999999999999999u64 as i64))
        .map_err(|e| e.to_string())?;
    tree.insert(b"key-double", Value::Double(2.38)).map_err(|e| e.to_string())?;
    tree.insert(b"key-true", Value::Bool(true)).map_err(|e| e.to_string())?;
    tree.insert(b"key-false", Value::Bool(false)).map_err(|e| e.to_string())?;
    tree.insert(b"key-null", Value::Null).map_err(|e| e.to_string())?;

    check_eq!(tree.len(), 7);
    check_eq!(tree.node_size(), 32);

    // Get their values again.
    check!(matches!(tree.at(b"key-missing"), Err(Error::KeyNotFound)));
    check_eq!(
        tree.at(b"key-string").map_err(|e| e.to_string())?,
        Value::from("value-string")
    );
    check_eq!(
        tree.at(b"key-int").map_err(|e| e.to_string())?,
        Value::Int(1024 * 1024 * -3)
    );
    check_eq!(
        tree.at(b"key-int-long").map_err(|e| e.to_string())?,
        Value::Int(0x9999999999999999u64 as i64)
    );
    check_eq!(tree.at(b"key-double").map_err(|e| e.to_string())?, Value::Double(2.38));
    check_eq!(tree.at(b"key-true").map_err(|e| e.to_string())?, Value::Bool(true));
    check_eq!(tree.at(b"key-false").map_err(|e| e.to_string())?, Value::Bool(false));
    check_eq!(tree.at(b"key-null").map_err(|e| e.to_string())?, Value::Null);

    // value_type() reports the same types; missing keys do not fail.
    check_eq!(tree.value_type(b"key-missing"), ValueType::Missing);
    check_eq!(tree.value_type(b"key-string"), ValueType::String);
    check_eq!(tree.value_type(b"key-int"), ValueType::Int);
    check_eq!(tree.value_type(b"key-int-long"), ValueType::Int);
    check_eq!(tree.value_type(b"key-double"), ValueType::Double);
    check_eq!(tree.value_type(b"key-true"), ValueType::Bool);
    check_eq!(tree.value_type(b"key-false"), ValueType::Bool);
    check_eq!(tree.value_type(b"key-null"), ValueType::Null);

    check!(!tree.exists(b"key-missing"));
    check!(tree.exists(b"key-string"));
    check!(tree.exists(b"key-int"));
    check!(tree.exists(b"key-int-long"));
    check!(tree.exists(b"key-double"));
    check!(tree.exists(b"key-true"));
    check!(tree.exists(b"key-false"));
    check!(tree.exists(b"key-null"));

    tree.clear().map_err(|e| e.to_string())?;
    check_eq!(tree.len(), 0);
    check_eq!(tree.node_size(), 1);

    check_eq!(initial_allocated, tree.allocator().bytes_allocated());
    Ok(())
}

fn run_incr_test(kind: &str) -> TestResult {
    println!("[{kind}] -- incr");

    let tree = get_or_create_tree(POOL_NAME, kind)?;
    let initial_allocated = tree.allocator().bytes_allocated();

    check_eq!(tree.len(), 0);
    tree.insert(b"key-int", Value::Int(10)).map_err(|e| e.to_string())?;
    tree.insert(b"key-int-long", Value::Int(0x3333333333333333))
        .map_err(|e| e.to_string())?;
    tree.insert(b"key-double", Value::Double(1.0)).map_err(|e| e.to_string())?;
    check_eq!(tree.len(), 3);

    // incr creates the key if it doesn't exist.
    check_eq!(tree.incr_int(b"key-int2", 100).map_err(|e| e.to_string())?, 100);
    check_eq!(
        tree.incr_int(b"key-int-long2", 0x5555555555555555)
            .map_err(|e| e.to_string())?,
        0x5555555555555555
    );
    check_eq!(
        tree.incr_double(b"key-double2", 10.0).map_err(|e| e.to_string())?,
        10.0
    );
    check_eq!(tree.at(b"key-int2").map_err(|e| e.to_string())?, Value::Int(100));
    check_eq!(
        tree.at(b"key-int-long2").map_err(|e| e.to_string())?,
        Value::Int(0x5555555555555555)
    );
    check_eq!(tree.at(b"key-double2").map_err(|e| e.to_string())?, Value::Double(10.0));
    check_eq!(tree.len(), 6);

    // incr returns the new value of the key.
    check_eq!(tree.incr_int(b"key-int2", -1).map_err(|e| e.to_string())?, 99);
    check_eq!(
        tree.incr_double(b"key-double2", -10.0).map_err(|e| e.to_string())?,
        0.0
    );
    check_eq!(tree.at(b"key-int2").map_err(|e| e.to_string())?, Value::Int(99));
    check_eq!(tree.at(b"key-double2").map_err(|e| e.to_string())?, Value::Double(0.0));
    check_eq!(tree.len(), 6);

    // incr on keys of the wrong type fails without touching them.
    tree.insert(b"key-null", Value::Null).map_err(|e| e.to_string())?;
    tree.insert(b"key-string", "value-string".into()).map_err(|e| e.to_string())?;
    check_eq!(tree.len(), 8);
    check!(matches!(
        tree.incr_double(b"key-null", 13.0),
        Err(Error::TypeMismatch { .. })
    ));
    check!(matches!(
        tree.incr_int(b"key-null", 13),
        Err(Error::TypeMismatch { .. })
    ));
    check!(matches!(
        tree.incr_double(b"key-string", 13.0),
        Err(Error::TypeMismatch { .. })
    ));
    check!(matches!(
        tree.incr_int(b"key-string", 13),
        Err(Error::TypeMismatch { .. })
    ));
    check!(matches!(
        tree.incr_double(b"key-int", 13.0),
        Err(Error::TypeMismatch { .. })
    ));
    check!(matches!(
        tree.incr_double(b"key-int-long", 13.0),
        Err(Error::TypeMismatch { .. })
    ));
    check!(matches!(
        tree.incr_double(b"key-int-long2", 13.0),
        Err(Error::TypeMismatch { .. })
    ));
    check!(matches!(
        tree.incr_int(b"key-double", 13),
        Err(Error::TypeMismatch { .. })
    ));

    // Integer wraparound is two's complement.
    check_eq!(
        tree.incr_int(b"key-int", 0xAAAAAAAAAAAAAAA0u64 as i64)
            .map_err(|e| e.to_string())?,
        0xAAAAAAAAAAAAAAAAu64 as i64
    );
    check_eq!(tree.len(), 8);
    check_eq!(
        tree.incr_int(b"key-int-long", -0x3333333333333330)
            .map_err(|e| e.to_string())?,
        3
    );
    check_eq!(tree.len(), 8);

    tree.clear().map_err(|e| e.to_string())?;
    check_eq!(tree.len(), 0);

    check_eq!(initial_allocated, tree.allocator().bytes_allocated());
    Ok(())
}

fn run_concurrent_readers_test(kind: &str) -> TestResult {
    println!("[{kind}] -- concurrent readers");

    // The tree must exist before the readers attach.
    let tree = get_or_create_tree(POOL_NAME, kind)?;

    let exe = std::env::current_exe().map_err(|e| e.to_string())?;
    let mut children = Vec::new();
    for _ in 0..8 {
        let child = Command::new(&exe)
            .args(["reader", "--pool", POOL_NAME, "--allocator", kind])
            .spawn()
            .map_err(|e| e.to_string())?;
        children.push(child);
    }

    for value in 100..110i64 {
        std::thread::sleep(Duration::from_millis(50));
        tree.insert(b"key1", Value::Int(value)).map_err(|e| e.to_string())?;
    }

    let mut failures = 0;
    for mut child in children {
        let pid = child.id();
        let status = child.wait().map_err(|e| e.to_string())?;
        if status.success() {
            println!("[{kind}] --   reader {pid} terminated successfully");
        } else {
            println!("[{kind}] --   reader {pid} failed ({status})");
            failures += 1;
        }
    }
    check_eq!(failures, 0);
    Ok(())
}

/// Reader process: poll key1 until the last written value is observed.
/// Values must never regress; skipping is fine. Exit 0 on success.
fn run_reader(pool_name: &str, kind: &str) -> i32 {
    let tree = match get_or_create_tree(pool_name, kind) {
        Ok(tree) => tree,
        Err(e) => {
            eprintln!("reader failed to attach: {e}");
            return 1;
        }
    };

    let deadline = Instant::now() + Duration::from_secs(1);
    let mut last_seen = 0i64;
    while Instant::now() < deadline {
        if let Ok(Value::Int(value)) = tree.at(b"key1") {
            if value < last_seen {
                eprintln!("reader saw regression: {value} after {last_seen}");
                return 1;
            }
            last_seen = value;
            if value == 109 {
                return 0;
            }
        }
        std::thread::yield_now();
    }
    eprintln!("reader timed out at {last_seen}");
    1
}

fn run_all() -> TestResult {
    for kind in ["simple", "logarithmic"] {
        Pool::delete(POOL_NAME, false).map_err(|e| e.to_string())?;
        run_basic_test(kind)?;
        run_reorganization_test(kind)?;
        run_types_test(kind)?;
        run_incr_test(kind)?;
        run_concurrent_readers_test(kind)?;
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Some(Commands::Reader { pool, allocator }) = cli.command {
        std::process::exit(run_reader(&pool, &allocator));
    }

    let result = run_all();
    let _ = Pool::delete(POOL_NAME, false);
    match result {
        Ok(()) => {
            println!("all tests passed");
        }
        Err(message) => {
            println!("failure: {message}");
            std::process::exit(1);
        }
    }
}
