//! Standalone journal verifier. Exits 0 on an intact chain, 1 on a break,
//! printing the first broken sequence number for the operator.

use anyhow::Result;

use sentinelfx::reliability::journal::Journal;

fn main() -> Result<()> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("JOURNAL_PATH").ok())
        .unwrap_or_else(|| "./sentinel.journal".to_string());

    let entries = Journal::read_all(&path)?;
    let (ok, broken) = Journal::verify_chain(&path)?;
    if ok {
        println!("OK {} entries, chain intact", entries.len());
        return Ok(());
    }
    match broken {
        Some(seq) => println!("CORRUPT chain broken at seq {}", seq),
        None => println!("CORRUPT chain broken"),
    }
    std::process::exit(1);
}
