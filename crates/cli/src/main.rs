use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use tokio::signal;
use tokio::sync::Notify;
use tracing::{info, warn};

use vellum_core::consts::A_TITLE;
use vellum_core::{AppId, Attribute, Label, LabelChanges, LabelList, ObjRef, StoredObject};
use vellum_persist::{Db, StoreConfig};
use vellum_store::{Actor, CreateOptions, DeletedObjects, ObjectStore, Projection, Query, SortBy};
use vellum_textidx::Synchronizer;

#[derive(Parser, Debug)]
#[command(name = "vellumctl", version, about = "Vellum object store CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Database file (default: VELLUM_DB_PATH or ~/.vellum/vellum.db)
    #[arg(long = "db", global = true)]
    db: Option<String>,

    /// Application id
    #[arg(long = "app", global = true, env = "VELLUM_APP", default_value_t = 1)]
    app: AppId,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the application's tables
    Init,
    /// Create an object from a YAML or JSON file
    Create {
        file: PathBuf,
        /// Store under this id instead of allocating one
        #[arg(long = "id")]
        id: Option<i64>,
    },
    /// Print the current version of an object
    Read { id: i64 },
    /// Replace an object's attributes and labels with those in a file
    Update { id: i64, file: PathBuf },
    /// Add or remove labels
    Relabel {
        id: i64,
        #[arg(long = "add", value_delimiter = ',')]
        add: Vec<Label>,
        #[arg(long = "remove", value_delimiter = ',')]
        remove: Vec<Label>,
    },
    /// Mark an object as deleted
    Delete { id: i64 },
    /// Remove the deleted mark
    Undelete { id: i64 },
    /// Remove an object and its history permanently
    Erase { id: i64 },
    /// List every stored version of an object
    History { id: i64 },
    /// Query objects by free text
    Query {
        /// Free text; empty matches everything
        text: Vec<String>,
        /// relevance, date, date_asc, title, title_desc or any
        #[arg(long = "sort", default_value = "relevance")]
        sort: String,
        #[arg(long = "limit", default_value_t = 20)]
        limit: usize,
        /// Restrict to objects of these types
        #[arg(long = "type", value_delimiter = ',')]
        types: Vec<i64>,
        #[arg(long = "include-deleted", action = ArgAction::SetTrue)]
        include_deleted: bool,
    },
    /// Bring the text index up to date
    Index {
        /// Keep indexing in the background until Ctrl-C
        #[arg(long = "follow", action = ArgAction::SetTrue)]
        follow: bool,
        /// Queue a reindex of every object first
        #[arg(long = "all", action = ArgAction::SetTrue)]
        all: bool,
    },
    /// Store statistics
    Stats,
}

/// Object file contents. `title` is shorthand for a plain text title
/// attribute.
#[derive(Debug, Deserialize)]
struct ObjectFile {
    #[serde(default)]
    labels: Vec<Label>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    attrs: Vec<Attribute>,
}

impl ObjectFile {
    fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let parsed = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&text)?,
            _ => serde_yaml::from_str(&text)?,
        };
        Ok(parsed)
    }

    fn apply(self, obj: &mut StoredObject) {
        obj.labels = LabelList::new(self.labels);
        let mut attrs = self.attrs;
        if let Some(t) = self.title {
            attrs.retain(|a| a.desc != A_TITLE);
            attrs.insert(0, Attribute { desc: A_TITLE, qualifier: 0, value: t.as_str().into(), group: None });
        }
        obj.set_attributes(attrs);
    }
}

fn init_tracing() {
    let env = std::env::var("VELLUM_LOG").unwrap_or_else(|_| "warn".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("VELLUM_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid VELLUM_METRICS_ADDR; expected host:port");
        }
    }
}

fn objref(id: i64) -> Result<ObjRef> {
    ObjRef::new(id).with_context(|| format!("invalid object id {}", id))
}

fn print_object(output: Output, obj: &StoredObject) -> Result<()> {
    match output {
        Output::Human => {
            let id = obj.objref.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string());
            println!("{} v{} labels={}", id, obj.version, obj.labels);
            for a in obj.attributes() {
                if a.qualifier == 0 {
                    println!("  {:<8} {}", a.desc, a.value);
                } else {
                    println!("  {:<8} {}", format!("{}/{}", a.desc, a.qualifier), a.value);
                }
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(obj)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let mut config = StoreConfig::from_env();
    if let Some(p) = cli.db.clone() {
        config = config.with_db_path(p);
    }
    let db = Arc::new(Db::open(config.clone())?);
    let trigger = Arc::new(Notify::new());
    let store = Arc::new(ObjectStore::open(db, cli.app)?.with_index_trigger(trigger.clone()));
    let actor = Actor::system();

    match cli.command {
        Commands::Init => {
            let t = store.tables();
            info!(app = cli.app, db = %config.db_path, "initialised");
            match cli.output {
                Output::Human => println!("app {} ready in {} (objects table {})", cli.app, config.db_path, t.objects),
                Output::Json => println!("{}", serde_json::json!({ "app": cli.app, "db": config.db_path, "objects": t.objects })),
            }
        }
        Commands::Create { file, id } => {
            let mut obj = StoredObject::new();
            ObjectFile::load(&file)?.apply(&mut obj);
            let opts = match id {
                Some(id) => CreateOptions::with_forced_id(objref(id)?),
                None => CreateOptions::default(),
            };
            let created = store.create(&actor, obj, opts)?;
            print_object(cli.output, &created)?;
        }
        Commands::Read { id } => {
            let obj = store.read(&actor, objref(id)?)?;
            print_object(cli.output, &obj)?;
        }
        Commands::Update { id, file } => {
            let mut obj = (*store.read(&actor, objref(id)?)?).clone();
            ObjectFile::load(&file)?.apply(&mut obj);
            let updated = store.update(&actor, obj)?;
            print_object(cli.output, &updated)?;
        }
        Commands::Relabel { id, add, remove } => {
            if add.is_empty() && remove.is_empty() {
                bail!("nothing to change: pass --add and/or --remove");
            }
            let changes = LabelChanges::new(LabelList::new(add), LabelList::new(remove));
            let obj = store.relabel(&actor, objref(id)?, changes)?;
            print_object(cli.output, &obj)?;
        }
        Commands::Delete { id } => {
            let obj = store.delete(&actor, objref(id)?)?;
            print_object(cli.output, &obj)?;
        }
        Commands::Undelete { id } => {
            let obj = store.undelete(&actor, objref(id)?)?;
            print_object(cli.output, &obj)?;
        }
        Commands::Erase { id } => {
            let r = objref(id)?;
            store.erase(&actor, r)?;
            match cli.output {
                Output::Human => println!("erased {}", r),
                Output::Json => println!("{}", serde_json::json!({ "erased": r })),
            }
        }
        Commands::History { id } => {
            let h = store.history(&actor, objref(id)?)?;
            match cli.output {
                Output::Human => {
                    println!("VERSION  UPDATED                    BY     TITLE");
                    for o in h.history.iter().chain(std::iter::once(h.object.as_ref())) {
                        let when = o.update_time.map(|t| t.to_rfc3339()).unwrap_or_default();
                        let by = o.modified_by.map(|u| u.to_string()).unwrap_or_default();
                        let title = o.title().map(|t| t.text.as_str()).unwrap_or("");
                        println!("{:<8} {:<26} {:<6} {}", o.version, when, by, title);
                    }
                }
                Output::Json => {
                    println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "object": &*h.object, "history": h.history }))?)
                }
            }
        }
        Commands::Query { text, sort, limit, types, include_deleted } => {
            let sort = SortBy::from_str(&sort)?;
            let mut q = Query::new();
            let text = text.join(" ");
            if !text.trim().is_empty() {
                q.free_text(&text, None, None);
            }
            if !types.is_empty() {
                let types = types.into_iter().map(objref).collect::<Result<Vec<_>>>()?;
                q.object_types(&types, true);
            }
            if include_deleted {
                q.deleted_objects(DeletedObjects::Include);
            }
            q.maximum_results(limit);
            let results = store.query(&actor, &q, sort, Projection::Objects)?;
            if results.is_empty() && !text.trim().is_empty() {
                if let Some(s) = store.suggest_spelling(&text)? {
                    eprintln!("no results; did you mean \"{}\"?", s);
                }
            }
            match cli.output {
                Output::Human => {
                    println!("ID         VERSION  TITLE");
                    for obj in results.objects() {
                        let obj = obj?;
                        let id = obj.objref.map(|r| r.to_string()).unwrap_or_default();
                        println!("{:<10} {:<8} {}", id, obj.version, obj.title().map(|t| t.text.as_str()).unwrap_or(""));
                    }
                }
                Output::Json => {
                    let objects = results.objects().collect::<vellum_core::Result<Vec<_>>>()?;
                    let objects: Vec<&StoredObject> = objects.iter().map(|o| o.as_ref()).collect();
                    println!("{}", serde_json::to_string_pretty(&objects)?);
                }
            }
        }
        Commands::Index { follow, all } => {
            if all {
                store.reindex_all_objects(None)?;
            }
            let sync = Arc::new(Synchronizer::new(&config, trigger));
            sync.register(store.clone())?;
            if follow {
                let handle = sync.clone().spawn();
                info!(app = cli.app, "indexing until Ctrl-C");
                signal::ctrl_c().await?;
                warn!("Ctrl-C received; stopping synchronizer");
                handle.shutdown().await?;
            } else {
                let mut total = vellum_textidx::PassStats::default();
                loop {
                    let s = sync.run_once()?;
                    total.indexed += s.indexed;
                    total.removed += s.removed;
                    total.failed += s.failed;
                    if !s.more || s.indexed + s.removed == 0 {
                        break;
                    }
                }
                match cli.output {
                    Output::Human => {
                        println!("indexed {} removed {} failed {}", total.indexed, total.removed, total.failed)
                    }
                    Output::Json => println!(
                        "{}",
                        serde_json::json!({ "indexed": total.indexed, "removed": total.removed, "failed": total.failed })
                    ),
                }
            }
        }
        Commands::Stats => {
            let s = store.statistics()?;
            let terms = store.text_index().term_count()?;
            let docs = store.text_index().document_count()?;
            match cli.output {
                Output::Human => {
                    println!("objects:    {}", s.objects);
                    println!("revisions:  {}", s.revisions);
                    println!("dirty:      {}", s.dirty);
                    println!("documents:  {}", docs);
                    println!("terms:      {}", terms);
                    println!("schema gen: {}", s.schema_generation);
                }
                Output::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({ "store": s, "documents": docs, "terms": terms }))?
                ),
            }
        }
    }

    Ok(())
}
