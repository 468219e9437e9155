use std::{env, process::exit, sync::Arc};

use args::{ArgumentsRequest, StartClientConfig, StartServerConfig, StartupArguments, StartupMode};
use p4rpc::{
    error::{Error, RpcError},
    net::AddressForm,
    rpc::{DispatchMode, DispatchTable, HandlerFuture, Rpc, RpcService},
    trust::FileTrustStore,
    RpcConfig,
};
use tokio::task::LocalSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod args;

fn main() {
    let arguments = match args::parse_arguments(env::args()) {
        Err(err) => {
            eprintln!("{err}\n\nType 'p4rpc --help' for a help menu");
            exit(1);
        }
        Ok(arguments) => arguments,
    };

    let startup_args = match arguments {
        ArgumentsRequest::Version => {
            println!("{}", args::get_version_string());
            println!("Flow-controlled RPC, now with fewer deadlocks");
            return;
        }
        ArgumentsRequest::Help => {
            println!("{}", args::get_help_string());
            return;
        }
        ArgumentsRequest::Run(startup_args) => startup_args,
    };

    let default_level = match (startup_args.verbose, startup_args.silent) {
        (_, true) => "error",
        (true, false) => "debug",
        (false, false) => "info",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    let runtime_result = tokio::runtime::Builder::new_current_thread().enable_all().build();

    let result = match runtime_result {
        Ok(runtime) => LocalSet::new().block_on(&runtime, async_main(startup_args)),
        Err(err) => {
            eprintln!("Failed to start Tokio runtime: {err}");
            exit(1);
        }
    };

    if let Err(error) = result {
        eprintln!("Program finished with error: {error}");
        exit(1);
    }
}

async fn async_main(startup_args: StartupArguments) -> Result<(), Error> {
    let mut config = RpcConfig::new();
    for tunable in &startup_args.tunables {
        config.set_tunable_v(tunable)?;
    }

    match startup_args.startup_mode {
        StartupMode::Server(server_config) => run_server(config, server_config).await,
        StartupMode::Client(client_config) => run_client(config, client_config).await,
    }
}

fn login<'a>(rpc: &'a mut Rpc, e: &'a mut RpcError) -> HandlerFuture<'a> {
    Box::pin(async move {
        let Some(user) = rpc.get_var_str("user").map(String::from) else {
            e.set(Error::Handler("login without a user".into()));
            return;
        };

        info!("User {user} logged in from {}", rpc.peer_address(AddressForm::IpPort).unwrap_or_default());
        rpc.set_var("user", &user);
        rpc.set_var("status", "ok");
        rpc.confirm().await;
    })
}

fn echo<'a>(rpc: &'a mut Rpc, _e: &'a mut RpcError) -> HandlerFuture<'a> {
    Box::pin(async move {
        rpc.copy_vars();
        rpc.confirm().await;
    })
}

async fn run_server(config: RpcConfig, server_config: StartServerConfig) -> Result<(), Error> {
    let mut service = RpcService::new(config);
    service.register(DispatchTable::new().with("login", login).with("echo", echo));
    service.finalize();
    service.set_protocol("server", env!("CARGO_PKG_VERSION"));
    service.set_endpoint(&server_config.address)?;
    service.listen().await?;

    let service = Arc::new(service);
    loop {
        let mut rpc = Rpc::new(Arc::clone(&service));
        if let Err(error) = rpc.connect().await {
            warn!("{error}");
            continue;
        }

        tokio::task::spawn_local(async move {
            if let Err(error) = rpc.client_mismatch().await {
                warn!("{error}");
                rpc.disconnect().await;
                return;
            }

            if rpc.is_ssl() && rpc.do_handshake().await.is_err() {
                rpc.disconnect().await;
                return;
            }

            rpc.dispatch(DispatchMode::Complete).await;
            rpc.disconnect().await;
        });
    }
}

async fn run_client(config: RpcConfig, client_config: StartClientConfig) -> Result<(), Error> {
    let mut service = RpcService::new(config);
    service.set_protocol("client", env!("CARGO_PKG_VERSION"));
    service.set_endpoint(&client_config.address)?;

    let mut rpc = Rpc::new(Arc::new(service));
    rpc.connect().await?;

    if rpc.is_ssl() {
        rpc.do_handshake().await?;
        info!("Secured with {}", rpc.encryption_type().unwrap_or_default());

        let mut store = FileTrustStore::new(&client_config.trust_file);
        let mut e = RpcError::new();
        rpc.check_known_host(&mut store, &mut e);

        let unknown = matches!(e.first(), Some(Error::HostKeyUnknown { .. }));
        if unknown && client_config.trust {
            warn!("{e}");
            rpc.establish_trust(&mut store)?;
        } else if e.test() {
            rpc.disconnect().await;
            return e.into_result();
        }
    }

    rpc.set_var("user", &client_config.user);
    rpc.invoke("login").await;
    rpc.dispatch(DispatchMode::Complete).await;
    rpc.errors().to_result()?;

    match rpc.get_var_str("status") {
        Some("ok") => println!("Logged in as {}", rpc.get_var_str("user").unwrap_or_default()),
        status => error!("Login failed with status {status:?}"),
    }

    rpc.set_var("message", "hello");
    rpc.invoke("echo").await;
    rpc.dispatch(DispatchMode::Complete).await;
    if let Some(message) = rpc.get_var_str("message") {
        println!("Server echoed '{message}'");
    }

    rpc.release_final().await;
    rpc.disconnect().await;
    info!("{}", rpc.track_report());
    Ok(())
}
