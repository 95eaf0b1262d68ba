//! hive - content-addressed object store command line interface

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hive::ops::{
    call, DeleteManifest, DeleteOldManifests, DiffTrees, DisablePooling, DiscUsage,
    EnablePooling, ExportTree, Fetch, Fsck, ImportDirectory, Inventory, NextTag, Prune, Push,
    ReorganizePool, ScanTree,
};
use hive::transport::{serve, StoreRegistry, TransferReport};
use hive::{Error, ManifestKey, ScanRoot, Store, TreeView};

#[derive(Parser)]
#[command(name = "hive")]
#[command(about = "content-addressed versioned object store")]
#[command(version)]
struct Cli {
    /// store path
    #[arg(short, long, env = "HIVE_STORE", default_value = ".")]
    store: PathBuf,

    /// more log output (-v info, -vv debug)
    #[arg(short = 'v', action = clap::ArgAction::Count, global = true)]
    verbosity: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// initialize a new store at the store path
    Init,

    /// import a directory as a manifest
    Import {
        /// source directory
        source: PathBuf,

        /// `name:tag`, or a bare name to take the next numeric tag
        manifest: String,

        /// labels as key=value
        #[arg(short, long = "label", value_parser = parse_label)]
        labels: Vec<(String, String)>,
    },

    /// write a manifest or tree out to a directory
    Export {
        /// `name:tag` or a tree id
        root: String,

        /// destination directory, missing or empty
        target: PathBuf,
    },

    /// manage manifests
    #[command(subcommand)]
    Manifest(ManifestCommand),

    /// verify manifests and the objects they reach
    Fsck {
        /// only these manifests
        keys: Vec<String>,

        /// delete broken manifests and corrupt objects
        #[arg(long)]
        repair: bool,
    },

    /// remove objects no manifest reaches
    Prune {
        /// list every removed object
        #[arg(long)]
        verbose: bool,

        /// only show what would be removed
        #[arg(long)]
        dry_run: bool,
    },

    /// inspect trees
    #[command(subcommand)]
    Tree(TreeCommand),

    /// disc usage per manifest
    Du {
        /// manifest name prefix
        prefix: Option<String>,

        /// ignore a cached report
        #[arg(long)]
        fresh: bool,
    },

    /// send manifests to a remote
    Push {
        /// remote name or url
        remote: String,

        #[arg(required = true)]
        keys: Vec<String>,

        #[arg(long)]
        dry_run: bool,
    },

    /// bring manifests over from a remote
    Fetch {
        /// remote name or url
        remote: String,

        #[arg(required = true)]
        keys: Vec<String>,

        #[arg(long)]
        dry_run: bool,
    },

    /// attach to, leave, or reorganize a shared object pool
    Pool {
        /// pool directory to attach to
        #[arg(required_unless_present_any = ["unpool", "reorganize"])]
        pool: Option<PathBuf>,

        /// attach even if fsck finds problems
        #[arg(long)]
        force: bool,

        /// copy pooled objects back and detach
        #[arg(long, conflicts_with_all = ["pool", "reorganize"])]
        unpool: bool,

        /// move shared objects into the pool; lists the other stores using it
        #[arg(long, num_args = 0.., value_name = "STORE", conflicts_with = "pool")]
        reorganize: Option<Vec<PathBuf>>,

        /// stores that must use an object before it is pooled
        #[arg(long, default_value_t = 2)]
        threshold: usize,
    },

    /// answer the remote protocol on stdin/stdout
    Serve,

    /// manage configured remotes
    #[command(subcommand)]
    Remote(RemoteCommand),
}

#[derive(Subcommand)]
enum ManifestCommand {
    /// list manifests with their root trees
    List {
        /// name prefix
        prefix: Option<String>,
    },

    /// delete manifests
    Delete {
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// keep only the newest numbered manifests of a name
    PruneOld {
        name: String,

        #[arg(long, default_value_t = 1)]
        keep: usize,
    },
}

#[derive(Subcommand)]
enum TreeCommand {
    /// list the entries below a manifest or tree
    List {
        root: String,

        /// levels to descend
        #[arg(short, long)]
        depth: Option<usize>,

        /// expand manifest references
        #[arg(long)]
        follow: bool,
    },

    /// show differences between two manifests or trees
    Diff {
        left: String,

        right: String,

        /// expand manifest references
        #[arg(long)]
        follow: bool,
    },
}

#[derive(Subcommand)]
enum RemoteCommand {
    /// add a named remote
    Add { name: String, url: String },

    /// remove a named remote
    Remove { name: String },

    /// list configured remotes
    List,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbosity);

    if let Err(e) = run(cli) {
        eprintln!("error: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_env("HIVE_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        _ => EnvFilter::new("debug"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> hive::Result<()> {
    match cli.command {
        Commands::Init => {
            Store::init(&cli.store)?;
            println!("initialized hive store at {}", cli.store.display());
        }

        Commands::Import {
            source,
            manifest,
            labels,
        } => {
            let store = Store::open(&cli.store)?;
            let key = if manifest.contains(':') {
                ManifestKey::parse(&manifest)?
            } else {
                let tag = call(&store, NextTag::new(manifest.as_str()))?;
                ManifestKey::numbered(manifest, tag)?
            };
            let mut request = ImportDirectory::new(source, key);
            for (name, value) in labels {
                request = request.label(name, value);
            }
            let imported = call(&store, request)?;
            println!("{} {}", imported.root(), imported.key());
        }

        Commands::Export { root, target } => {
            let store = Store::open(&cli.store)?;
            let stats = call(&store, ExportTree::new(ScanRoot::parse(&root)?, &target))?;
            println!(
                "exported {} files, {} directories, {} bytes to {}",
                stats.files,
                stats.directories,
                stats.bytes,
                target.display()
            );
        }

        Commands::Manifest(command) => {
            let store = Store::open(&cli.store)?;
            match command {
                ManifestCommand::List { prefix } => {
                    let mut request = Inventory::new();
                    if let Some(prefix) = prefix {
                        request = request.prefix(prefix);
                    }
                    for (key, root) in call(&store, request)? {
                        println!("{} {}", root, key);
                    }
                }
                ManifestCommand::Delete { keys } => {
                    for key in parse_keys(&keys)? {
                        call(&store, DeleteManifest::new(key.clone()))?;
                        println!("deleted {}", key);
                    }
                }
                ManifestCommand::PruneOld { name, keep } => {
                    for key in call(&store, DeleteOldManifests::new(name, keep))? {
                        println!("deleted {}", key);
                    }
                }
            }
        }

        Commands::Fsck { keys, repair } => {
            let store = Store::open(&cli.store)?;
            let report = call(&store, Fsck::new().keys(parse_keys(&keys)?).repair(repair))?;

            println!(
                "manifests checked: {}, objects checked: {}",
                report.manifests_checked, report.objects_checked
            );
            if !report.broken.is_empty() {
                println!("\nbroken elements:");
                for element in &report.broken {
                    println!("  {}", element);
                }
            }
            if !report.interrupted_transactions.is_empty() {
                println!(
                    "\ninterrupted transactions: {}",
                    report.interrupted_transactions.len()
                );
            }

            if repair {
                println!(
                    "\nremoved {} manifests and {} objects",
                    report.repaired_manifests.len(),
                    report.removed_objects.len()
                );
            } else if report.is_ok() {
                println!("\nstore is healthy");
            } else {
                println!("\nstore has issues");
                return Err(Error::CorruptObjectMessage(
                    "store integrity check failed".to_string(),
                ));
            }
        }

        Commands::Prune { verbose, dry_run } => {
            let store = Store::open(&cli.store)?;
            let report = call(&store, Prune::new().dry_run(dry_run))?;

            if verbose {
                for (id, bytes) in &report.freed {
                    println!("{} {}", id, bytes);
                }
            }
            let action = if dry_run { "would remove" } else { "removed" };
            println!(
                "{} {} objects, {} bytes",
                action,
                report.objects(),
                report.bytes()
            );
        }

        Commands::Tree(command) => {
            let store = Store::open(&cli.store)?;
            match command {
                TreeCommand::List {
                    root,
                    depth,
                    follow,
                } => {
                    let mut request = ScanTree::new(ScanRoot::parse(&root)?).follow_references(follow);
                    if let Some(depth) = depth {
                        request = request.max_depth(depth);
                    }
                    let view = call(&store, request)?;
                    view.walk(|path, node| println!("{}", describe(path, node)));
                }
                TreeCommand::Diff {
                    left,
                    right,
                    follow,
                } => {
                    let request = DiffTrees::new(ScanRoot::parse(&left)?, ScanRoot::parse(&right)?)
                        .follow_references(follow);
                    for change in call(&store, request)? {
                        println!("{}", change);
                    }
                }
            }
        }

        Commands::Du { prefix, fresh } => {
            let store = Store::open(&cli.store)?;
            let mut request = DiscUsage::new().fresh(fresh);
            if let Some(prefix) = prefix {
                request = request.prefix(prefix);
            }
            let report = call(&store, request)?;
            for entry in &report.entries {
                println!(
                    "{:>12} {:>12} {:>8} {}",
                    entry.total_bytes, entry.exclusive_bytes, entry.objects, entry.key
                );
            }
            println!(
                "total {} bytes, {} shared",
                report.total_bytes, report.shared_bytes
            );
        }

        Commands::Push {
            remote,
            keys,
            dry_run,
        } => {
            let store = Store::open(&cli.store)?;
            let report = call(&store, Push::new(remote.as_str(), parse_keys(&keys)?).dry_run(dry_run))?;
            print_transfer("push", &remote, &report);
        }

        Commands::Fetch {
            remote,
            keys,
            dry_run,
        } => {
            let store = Store::open(&cli.store)?;
            let report = call(&store, Fetch::new(remote.as_str(), parse_keys(&keys)?).dry_run(dry_run))?;
            print_transfer("fetch", &remote, &report);
        }

        Commands::Pool {
            pool,
            force,
            unpool,
            reorganize,
            threshold,
        } => {
            let store = Store::open(&cli.store)?;
            if unpool {
                let copied = call(&store, DisablePooling::new())?;
                println!("unpooled, copied back {} objects", copied);
            } else if let Some(others) = reorganize {
                let report = call(&store, ReorganizePool::new(others).usage_threshold(threshold))?;
                println!(
                    "{} stores, {} objects: {} pooled, {} local copies removed, {} unused removed, {} bytes freed",
                    report.stores,
                    report.objects_considered,
                    report.adopted,
                    report.local_removed,
                    report.pool_removed,
                    report.bytes_freed
                );
            } else if let Some(pool) = pool {
                call(&store, EnablePooling::new(&pool).force(force))?;
                println!("pooled to {}", pool.display());
            }
        }

        Commands::Serve => {
            let registry = StoreRegistry::with_default(Store::open(&cli.store)?);
            let stdin = std::io::stdin();
            let stdout = std::io::stdout();
            serve(&registry, stdin.lock(), stdout.lock())?;
        }

        Commands::Remote(command) => {
            let store = Store::open(&cli.store)?;
            match command {
                RemoteCommand::Add { name, url } => {
                    store.update_config(|c| c.add_remote(name.as_str(), url.as_str()))?;
                    println!("added remote {}", name);
                }
                RemoteCommand::Remove { name } => {
                    store.update_config(|c| c.remove_remote(&name))?;
                    println!("removed remote {}", name);
                }
                RemoteCommand::List => {
                    for remote in store.config().remotes {
                        println!("{} {}", remote.name, remote.url);
                    }
                }
            }
        }
    }

    Ok(())
}

fn parse_keys(keys: &[String]) -> hive::Result<Vec<ManifestKey>> {
    keys.iter().map(|k| ManifestKey::parse(k)).collect()
}

fn parse_label(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {}", s))
}

fn describe(path: &str, node: &TreeView) -> String {
    match node {
        TreeView::Blob { id, size } => format!("blob     {} {:>10} {}", id, size, path),
        TreeView::Tree { id, truncated, .. } => {
            let mark = if *truncated { " ..." } else { "" };
            format!("tree     {} {:>10} {}/{}", id, "-", path, mark)
        }
        TreeView::ManifestRef { id, key, .. } => {
            format!("manifest {} {:>10} {} -> {}", id, "-", path, key)
        }
        TreeView::Missing { id, expected } => {
            format!("missing  {} {:>10} {} ({:?})", id, "-", path, expected)
        }
    }
}

fn print_transfer(verb: &str, remote: &str, report: &TransferReport) {
    let prefix = if report.dry_run { "would " } else { "" };
    println!(
        "{}{} {} manifests to {}: {} of {} trees, {} of {} blobs, {} bytes",
        prefix,
        verb,
        report.manifests_requested,
        remote,
        report.trees_transferred,
        report.trees_in_closure,
        report.blobs_transferred,
        report.blobs_in_closure,
        report.bytes_transferred
    );
}
