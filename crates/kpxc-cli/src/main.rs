mod store;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kpxc_core::{
    AssociationCredentials, AutoTypeRequest, Client, ClientError, CreateNewGroupRequest,
    DatabaseGroup, DeleteEntryRequest, GetLoginsRequest, GetTotpRequest, SetLoginRequest,
};
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::store::CredentialStore;

#[derive(Parser)]
#[command(name = "kpxc")]
#[command(about = "Query a running KeePassXC through its browser integration", long_about = None)]
struct Cli {
    /// Socket or pipe path. Defaults to $KPXC_SOCKET, then discovery.
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Seconds to wait for each reply; 0 waits indefinitely
    #[arg(long, global = true, default_value = "30")]
    timeout: u64,

    /// Keyring service holding stored associations
    #[arg(long, global = true, default_value = store::DEFAULT_SERVICE)]
    keyring_service: String,

    /// More logging on stderr (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the hash of the open database
    Hash {
        /// Ask KeePassXC to prompt for unlock
        #[arg(long)]
        unlock: bool,
    },

    /// Register a new association and store it in the keyring
    Associate,

    /// Check the stored association is still accepted
    Test,

    /// List database groups
    Groups,

    /// Create a group; slashes create nested groups
    CreateGroup { name: String },

    /// Find logins for a URL
    Logins {
        url: String,
        #[arg(long)]
        submit_url: Option<String>,
        #[arg(long)]
        http_auth: Option<String>,
    },

    /// Create a login, or update one by uuid
    SetLogin {
        url: String,
        #[arg(long)]
        login: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        uuid: Option<String>,
        #[arg(long)]
        group: Option<String>,
        #[arg(long)]
        group_uuid: Option<String>,
        #[arg(long)]
        submit_url: Option<String>,
    },

    /// Delete an entry
    Delete { uuid: String },

    /// Open the password generator
    GeneratePassword,

    /// Lock the database
    Lock,

    /// Print the current TOTP of an entry
    Totp { uuid: String },

    /// Auto-type the entry matching a URL or domain
    Autotype { search: String },

    /// Print lock changes until Ctrl-C
    Watch,

    /// Remove the stored association for the open database
    Forget,
}

enum Event {
    Lock(bool),
    Error(ClientError),
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let store = CredentialStore::new(cli.keyring_service);
    let (events_tx, events) = mpsc::unbounded_channel();
    let errors_tx = events_tx.clone();

    let mut builder = Client::builder()
        .request_timeout((cli.timeout > 0).then(|| Duration::from_secs(cli.timeout)))
        .on_lock_change(move |locked| {
            let _ = events_tx.send(Event::Lock(locked));
        })
        .on_async_error(move |err| {
            let _ = errors_tx.send(Event::Error(err));
        });
    if let Some(socket) = cli.socket {
        builder = builder.socket_path(socket);
    }

    let client = builder.connect().await.context("connect to KeePassXC")?;
    let result = run(&client, cli.command, &store, events).await;
    client.close().await;
    result
}

async fn run(
    client: &Client,
    command: Commands,
    store: &CredentialStore,
    mut events: mpsc::UnboundedReceiver<Event>,
) -> Result<()> {
    match command {
        Commands::Hash { unlock } => {
            let resp = client.get_database_hash(unlock).await?;
            println!("{}", resp.hash);
        }

        Commands::Associate => {
            let hash = client.get_database_hash(true).await?.hash;
            let creds = client.associate().await.context("associate")?;
            store.save(&hash, &creds)?;
            print_association(&creds);
        }

        Commands::Test => {
            let hash = client.get_database_hash(true).await?.hash;
            let Some(creds) = store.load(&hash)? else {
                bail!("no stored association for database {hash}; run `kpxc associate`");
            };
            client.set_association_credentials(Some(creds));
            let resp = client.test_associate().await?;
            println!("association {} accepted", resp.id);
        }

        Commands::Groups => {
            associate(client, store).await?;
            let resp = client.get_database_groups().await?;
            print_groups(&resp.groups.groups, 0);
        }

        Commands::CreateGroup { name } => {
            associate(client, store).await?;
            let resp = client
                .create_new_group(&CreateNewGroupRequest { name })
                .await?;
            println!("{}\t{}", resp.uuid, resp.name);
        }

        Commands::Logins {
            url,
            submit_url,
            http_auth,
        } => {
            associate(client, store).await?;
            let req = GetLoginsRequest {
                url,
                submit_url: submit_url.unwrap_or_default(),
                http_auth: http_auth.unwrap_or_default(),
                keys: Vec::new(),
            };
            match client.get_logins(req).await {
                Ok(resp) => {
                    for entry in resp.entries {
                        let expired = if entry.expired { "\texpired" } else { "" };
                        println!(
                            "{}\t{}\t{}\t{}{expired}",
                            entry.uuid, entry.name, entry.login, entry.password
                        );
                    }
                }
                Err(ClientError::Daemon(err)) if err.is_no_logins_found() => {
                    eprintln!("no logins found");
                }
                Err(err) => return Err(err.into()),
            }
        }

        Commands::SetLogin {
            url,
            login,
            password,
            uuid,
            group,
            group_uuid,
            submit_url,
        } => {
            associate(client, store).await?;
            let req = SetLoginRequest {
                submit_url: submit_url.unwrap_or_else(|| url.clone()),
                url,
                login,
                password,
                group: group.unwrap_or_default(),
                group_uuid: group_uuid.unwrap_or_default(),
                uuid: uuid.unwrap_or_default(),
                download_favicon: false,
            };
            client.set_login(&req).await?;
        }

        Commands::Delete { uuid } => {
            associate(client, store).await?;
            client.delete_entry(&DeleteEntryRequest { uuid }).await?;
        }

        Commands::GeneratePassword => {
            associate(client, store).await?;
            client.generate_password().await?;
        }

        Commands::Lock => {
            associate(client, store).await?;
            client.lock_database().await?;
        }

        Commands::Totp { uuid } => {
            associate(client, store).await?;
            let resp = client.get_totp(&GetTotpRequest { uuid }).await?;
            println!("{}", resp.totp);
        }

        Commands::Autotype { search } => {
            associate(client, store).await?;
            client.request_autotype(&AutoTypeRequest { search }).await?;
        }

        Commands::Watch => {
            eprintln!("watching for lock changes, Ctrl-C to stop");
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Some(Event::Lock(true)) => println!("locked"),
                        Some(Event::Lock(false)) => println!("unlocked"),
                        Some(Event::Error(err)) if err.is_transport() => return Err(err.into()),
                        Some(Event::Error(err)) => eprintln!("error: {err}"),
                        None => break,
                    },
                }
            }
        }

        Commands::Forget => {
            let hash = client.get_database_hash(false).await?.hash;
            if store.delete(&hash)? {
                println!("forgot association for {hash}");
            } else {
                println!("nothing stored for {hash}");
            }
        }
    }

    Ok(())
}

/// Use the stored association for the open database, creating one on first
/// use.
async fn associate(client: &Client, store: &CredentialStore) -> Result<()> {
    let hash = client
        .get_database_hash(true)
        .await
        .context("get database hash")?
        .hash;

    if let Some(creds) = store.load(&hash)? {
        debug!(%hash, id = %creds.id, "using stored association");
        client.set_association_credentials(Some(creds));
        return Ok(());
    }

    eprintln!("database {hash} is not associated yet; confirm the request in KeePassXC");
    let creds = client.associate().await.context("associate")?;
    store.save(&hash, &creds)?;
    info!(%hash, "stored new association");
    print_association(&creds);
    Ok(())
}

fn print_association(creds: &AssociationCredentials) {
    eprintln!(
        "associated as {} (key {})",
        creds.id,
        hex::encode(&creds.public_key[..8])
    );
}

fn print_groups(groups: &[DatabaseGroup], depth: usize) {
    for group in groups {
        println!("{:indent$}{}\t{}", "", group.name, group.uuid, indent = depth * 2);
        print_groups(&group.children, depth + 1);
    }
}
