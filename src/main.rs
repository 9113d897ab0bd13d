use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use rand::{rngs::OsRng, RngCore};
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use grid_ledger::{
    auth::{principal_of, ReplayGuard, SignedCall},
    calls::{self, CallReceipt, LedgerCall},
    ledger::{GridLedger, Principal},
    LedgerConfig,
};

#[derive(Parser, Debug)]
#[command(name = "grid-ledger", about = "Replay calls against a grid energy ledger")]
struct Args {
    /// Log filter, overridden by RUST_LOG.
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a JSON script of calls against a fresh ledger.
    Run {
        #[arg(long)]
        script: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Administrator principal; overrides the config file.
        #[arg(long)]
        admin: Option<String>,
        /// Reject entries that are not signed.
        #[arg(long)]
        require_signatures: bool,
        #[arg(long)]
        snapshot_out: Option<PathBuf>,
    },
    /// Generate an ed25519 keypair (sk.hex / pk.hex).
    Keygen {
        #[arg(long)]
        out_dir: PathBuf,
    },
    /// Sign a call with a secret key and print the signed entry.
    Sign {
        #[arg(long)]
        sk_hex: String,
        #[arg(long, default_value_t = 0)]
        nonce: u64,
        /// Call as JSON, e.g. {"op":"get_grid_balance"}.
        #[arg(long)]
        call: String,
    },
}

/// One step of a replay script.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum ScriptEntry {
    Signed(SignedCall),
    Batch {
        caller: Principal,
        batch: Vec<LedgerCall>,
    },
    Trusted {
        caller: Principal,
        call: LedgerCall,
    },
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>, admin: Option<String>) -> Result<LedgerConfig> {
    let mut config = match path {
        Some(path) => LedgerConfig::load(path)?,
        None => LedgerConfig::new(String::new()),
    };
    if let Some(admin) = admin {
        config.administrator = admin;
    }
    config
        .validate()
        .context("an administrator is required (--admin or config file)")?;
    Ok(config)
}

fn unauthenticated(err: impl std::fmt::Display) -> CallReceipt {
    CallReceipt::Err {
        error: "unauthenticated".to_string(),
        message: err.to_string(),
    }
}

fn malformed_entry(err: impl std::fmt::Display) -> CallReceipt {
    CallReceipt::Err {
        error: "malformed_entry".to_string(),
        message: err.to_string(),
    }
}

/// Splits a script into entries, keeping a bad entry from failing the rest.
fn parse_script(bytes: &[u8]) -> Result<Vec<Result<ScriptEntry, String>>> {
    let values: Vec<serde_json::Value> = serde_json::from_slice(bytes)?;
    Ok(values
        .into_iter()
        .map(|value| serde_json::from_value(value).map_err(|err| err.to_string()))
        .collect())
}

fn replay(
    ledger: &mut GridLedger,
    entries: &[Result<ScriptEntry, String>],
    require_signatures: bool,
) -> Vec<CallReceipt> {
    let mut guard = ReplayGuard::new();
    let mut receipts = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        match entry {
            Ok(entry) => receipts.extend(execute(ledger, &mut guard, entry, require_signatures)),
            Err(err) => {
                warn!(index, error = %err, "skipping malformed script entry");
                receipts.push(malformed_entry(err));
            }
        }
    }
    receipts
}

fn execute(
    ledger: &mut GridLedger,
    guard: &mut ReplayGuard,
    entry: &ScriptEntry,
    require_signatures: bool,
) -> Vec<CallReceipt> {
    match entry {
        ScriptEntry::Signed(signed) => match guard.admit(signed) {
            Ok(caller) => {
                vec![CallReceipt::from(calls::apply(ledger, &caller, &signed.call))]
            }
            Err(err) => {
                warn!(error = %err, "signed call rejected");
                vec![unauthenticated(err)]
            }
        },
        ScriptEntry::Trusted { .. } | ScriptEntry::Batch { .. } if require_signatures => {
            vec![unauthenticated("entry is not signed")]
        }
        ScriptEntry::Trusted { caller, call } => {
            vec![CallReceipt::from(calls::apply(ledger, caller, call))]
        }
        ScriptEntry::Batch { caller, batch } => match calls::apply_batch(ledger, caller, batch) {
            Ok(outcomes) => outcomes
                .into_iter()
                .map(|outcome| CallReceipt::Ok { outcome })
                .collect(),
            Err(err) => vec![CallReceipt::Err {
                error: err.source.kind().to_string(),
                message: err.to_string(),
            }],
        },
    }
}

fn run_cmd(
    script: &Path,
    config: Option<&Path>,
    admin: Option<String>,
    require_signatures: bool,
    snapshot_out: Option<&Path>,
) -> Result<()> {
    let config = load_config(config, admin)?;
    let bytes = fs::read(script).with_context(|| format!("read script {}", script.display()))?;
    let entries =
        parse_script(&bytes).with_context(|| format!("parse script {}", script.display()))?;
    info!(
        administrator = %config.administrator,
        entries = entries.len(),
        "replaying script"
    );

    let mut ledger = config.build();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for receipt in replay(&mut ledger, &entries, require_signatures) {
        serde_json::to_writer(&mut out, &receipt)?;
        writeln!(out)?;
    }

    let snapshot = ledger.snapshot();
    info!(
        height = snapshot.height,
        facilities = snapshot.facilities.len(),
        grid_balance = snapshot.grid_balance,
        state_root = %hex::encode(snapshot.state_root),
        "replay finished"
    );
    let snapshot_json = serde_json::to_vec_pretty(&snapshot)?;
    match snapshot_out {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("mkdir {}", parent.display()))?;
            }
            fs::write(path, &snapshot_json)
                .with_context(|| format!("write snapshot {}", path.display()))?;
            info!(path = %path.display(), "snapshot written");
        }
        None => {
            out.write_all(&snapshot_json)?;
            writeln!(out)?;
        }
    }
    Ok(())
}

fn keygen_cmd(out_dir: &Path) -> Result<()> {
    fs::create_dir_all(out_dir).with_context(|| format!("mkdir {}", out_dir.display()))?;

    let mut sk_bytes = [0u8; 32];
    OsRng.fill_bytes(&mut sk_bytes);
    let sk = SigningKey::from_bytes(&sk_bytes);

    fs::write(out_dir.join("sk.hex"), hex::encode(sk_bytes))?;
    fs::write(out_dir.join("pk.hex"), principal_of(&sk.verifying_key()))?;
    info!(out_dir = %out_dir.display(), "keypair written");
    Ok(())
}

fn parse_sk_hex(sk_hex: &str) -> Result<SigningKey> {
    let bytes = hex::decode(sk_hex.trim()).context("invalid sk-hex")?;
    let Ok(bytes) = <[u8; 32]>::try_from(bytes.as_slice()) else {
        bail!("sk-hex must be 32 bytes (64 hex chars)");
    };
    Ok(SigningKey::from_bytes(&bytes))
}

fn sign_cmd(sk_hex: &str, nonce: u64, call: &str) -> Result<()> {
    let sk = parse_sk_hex(sk_hex)?;
    let call: LedgerCall = serde_json::from_str(call).context("parse --call")?;
    let signed = SignedCall::sign(&sk, nonce, call);
    println!("{}", serde_json::to_string(&signed)?);
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_json);

    match args.command {
        Command::Run {
            script,
            config,
            admin,
            require_signatures,
            snapshot_out,
        } => run_cmd(
            &script,
            config.as_deref(),
            admin,
            require_signatures,
            snapshot_out.as_deref(),
        ),
        Command::Keygen { out_dir } => keygen_cmd(&out_dir),
        Command::Sign { sk_hex, nonce, call } => sign_cmd(&sk_hex, nonce, &call),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use grid_ledger::ledger::LedgerSnapshot;

    const ADMIN: &str = "operator";

    fn entries(json: &str) -> Vec<ScriptEntry> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn parses_run_arguments() {
        let args = Args::parse_from([
            "grid-ledger",
            "run",
            "--script",
            "calls.json",
            "--admin",
            ADMIN,
            "--require-signatures",
        ]);
        match args.command {
            Command::Run {
                admin,
                require_signatures,
                ..
            } => {
                assert_eq!(admin.as_deref(), Some(ADMIN));
                assert!(require_signatures);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn admin_flag_is_required_without_config() {
        assert!(load_config(None, None).is_err());
        assert_eq!(load_config(None, Some(ADMIN.into())).unwrap().administrator, ADMIN);
    }

    fn error_kind(receipt: &CallReceipt) -> Option<&str> {
        match receipt {
            CallReceipt::Err { error, .. } => Some(error.as_str()),
            CallReceipt::Ok { .. } => None,
        }
    }

    #[test]
    fn replays_trusted_and_batch_entries() {
        let script = entries(
            r#"[
                {"caller":"alice","call":{"op":"add_storage","capacity":1000}},
                {"caller":"bob","call":{"op":"store_energy","facility_id":1,"amount":1500}},
                {"caller":"alice","batch":[
                    {"op":"store_energy","facility_id":1,"amount":500},
                    {"op":"release_energy","facility_id":1,"amount":200}
                ]},
                {"caller":"operator","call":{"op":"update_grid_balance","amount":1000}}
            ]"#,
        );
        let mut ledger = GridLedger::new(ADMIN);
        let mut guard = ReplayGuard::new();
        let receipts: Vec<_> = script
            .iter()
            .flat_map(|e| execute(&mut ledger, &mut guard, e, false))
            .collect();
        assert_eq!(receipts.len(), 5);
        assert_eq!(error_kind(&receipts[1]), Some("capacity_exceeded"));
        assert_eq!(ledger.get_storage(1).unwrap().current_level, 300);
        assert_eq!(ledger.get_grid_balance(), 700);
    }

    #[test]
    fn signed_entries_authenticate_and_unsigned_can_be_refused() {
        let sk = SigningKey::generate(&mut OsRng);
        let signed = SignedCall::sign(&sk, 1, LedgerCall::AddStorage { capacity: 10 });
        let json = format!(
            r#"[{}, {{"caller":"alice","call":{{"op":"get_grid_balance"}}}}]"#,
            serde_json::to_string(&signed).unwrap()
        );
        let script = entries(&json);
        assert!(matches!(script[0], ScriptEntry::Signed(_)));

        let mut ledger = GridLedger::new(ADMIN);
        let mut guard = ReplayGuard::new();
        execute(&mut ledger, &mut guard, &script[0], true);
        assert_eq!(
            ledger.get_storage(1).unwrap().owner,
            principal_of(&sk.verifying_key())
        );
        let refused = execute(&mut ledger, &mut guard, &script[1], true);
        assert_eq!(error_kind(&refused[0]), Some("unauthenticated"));
        let replayed = execute(&mut ledger, &mut guard, &script[0], true);
        assert_eq!(error_kind(&replayed[0]), Some("unauthenticated"));
        assert_eq!(ledger.facility_count(), 1);
    }

    #[test]
    fn bad_entries_get_receipts_and_replay_continues() {
        let sk = SigningKey::generate(&mut OsRng);
        let mut forged = SignedCall::sign(&sk, 1, LedgerCall::AddStorage { capacity: 7 });
        forged.signature = "zz".into();
        let json = format!(
            r#"[
                {{"caller":"alice","call":{{"op":"add_storage","capacity":5}}}},
                {},
                {{"caller":"alice","call":{{"op":"drain_grid"}}}},
                {{"caller":"bob","call":{{"op":"store_energy","facility_id":1,"amount":5}}}}
            ]"#,
            serde_json::to_string(&forged).unwrap()
        );
        let script = parse_script(json.as_bytes()).unwrap();
        assert_eq!(script.len(), 4);
        assert!(script[2].is_err());

        let mut ledger = GridLedger::new(ADMIN);
        let receipts = replay(&mut ledger, &script, false);
        assert_eq!(receipts.len(), 4);
        assert_eq!(error_kind(&receipts[0]), None);
        match &receipts[1] {
            CallReceipt::Err { error, message } => {
                assert_eq!(error, "unauthenticated");
                assert!(message.contains("malformed signature"), "{message}");
            }
            other => panic!("unexpected receipt {other:?}"),
        }
        assert_eq!(error_kind(&receipts[2]), Some("malformed_entry"));
        assert_eq!(error_kind(&receipts[3]), None);
        assert_eq!(ledger.get_storage(1).unwrap().current_level, 5);
        assert_eq!(ledger.facility_count(), 1);
    }

    #[test]
    fn run_writes_snapshot_file() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("calls.json");
        fs::write(
            &script,
            r#"[
                {"caller":"alice","call":{"op":"add_storage","capacity":1000}},
                {"caller":"alice","call":{"op":"store_energy","facility_id":1,"amount":500}},
                {"caller":"alice","call":{"op":"release_energy","facility_id":1,"amount":200}}
            ]"#,
        )
        .unwrap();
        let snapshot_path = dir.path().join("out").join("snapshot.json");

        run_cmd(
            &script,
            None,
            Some(ADMIN.into()),
            false,
            Some(snapshot_path.as_path()),
        )
        .unwrap();

        let snapshot: LedgerSnapshot =
            serde_json::from_slice(&fs::read(&snapshot_path).unwrap()).unwrap();
        assert_eq!(snapshot.administrator, ADMIN);
        assert_eq!(snapshot.height, 3);
        assert_eq!(snapshot.grid_balance, -300);
        assert_eq!(snapshot.facilities[0].current_level, 300);
    }

    #[test]
    fn keygen_writes_matching_keypair() {
        let dir = tempfile::tempdir().unwrap();
        let keys = dir.path().join("keys");
        keygen_cmd(&keys).unwrap();

        let sk = parse_sk_hex(&fs::read_to_string(keys.join("sk.hex")).unwrap()).unwrap();
        let pk = fs::read_to_string(keys.join("pk.hex")).unwrap();
        assert_eq!(pk, principal_of(&sk.verifying_key()));
    }

    #[test]
    fn signing_key_must_be_32_hex_bytes() {
        let short = hex::encode([7u8; 31]);
        assert!(parse_sk_hex(&short).is_err());
        assert!(parse_sk_hex("not-hex").is_err());
        assert!(sign_cmd(&short, 0, r#"{"op":"get_grid_balance"}"#).is_err());

        let key = hex::encode([7u8; 32]);
        assert!(sign_cmd(&key, 0, r#"{"op":"get_grid_balance"}"#).is_ok());
        assert!(sign_cmd(&key, 0, "{}").is_err());
    }
}
