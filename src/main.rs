//! vm-controller - KubeVirt VM provisioning and lifecycle CLI

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};

use vm_controller::cluster::{ClusterApi, KubeCluster, OsKubeEnv};
use vm_controller::config::{ControllerArgs, ControllerConfig};
use vm_controller::guard;
use vm_controller::lifecycle::{LifecycleDispatcher, VmLifecycle};
use vm_controller::manifest::{self, Substitutions, VmResourceBuilder};
use vm_controller::model::{NewVirtualMachine, ProvisionRequest, VirtualMachine};
use vm_controller::ports::PortAllocator;
use vm_controller::provision::Provisioner;
use vm_controller::repository::{InMemoryVmRepository, VmRepository};
use vm_controller::service::{Health, VmService};
use vm_controller::telemetry::{init_telemetry, TelemetryConfig};

/// vm-controller - provision and manage per-user KubeVirt virtual machines
#[derive(Parser, Debug)]
#[command(name = "vm-controller", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    controller: ControllerArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate inputs and print the objects a provisioning run would create
    ///
    /// Runs offline: no cluster connection is made.
    Render(ProvisionArgs),

    /// Provision one VM and print the result as JSON
    Provision(ProvisionArgs),

    /// Stop a VM and wait until it reports Stopped
    Stop(VmArgs),

    /// Start a VM and wait until it reports Running
    Start(VmArgs),

    /// Delete a VM's cluster objects
    Delete(VmArgs),

    /// Print the first band port no Service in the cluster uses
    Port,

    /// Check cluster connectivity
    Health,
}

/// Inputs for a provisioning run
#[derive(Args, Debug)]
struct ProvisionArgs {
    /// Target namespace
    #[arg(long)]
    namespace: String,

    /// VM name
    #[arg(long)]
    name: String,

    /// Access secret injected into cloud-init
    #[arg(long, env = "VM_SECRET", hide_env_values = true)]
    secret: String,

    /// Host routed to the VM's web service
    #[arg(long)]
    access_host: String,

    /// SSH NodePort
    #[arg(long)]
    port: u16,

    /// VM template directory, relative to the working directory
    #[arg(long, default_value = "yaml-data/client-vm")]
    manifest_dir: PathBuf,

    /// Build VM objects in code instead of reading templates
    #[arg(long)]
    typed: bool,

    /// Image for the typed builder; defaults to --default-image
    #[arg(long)]
    image: Option<String>,
}

impl ProvisionArgs {
    fn request(&self) -> ProvisionRequest {
        ProvisionRequest {
            namespace: self.namespace.clone(),
            vm_name: self.name.clone(),
            secret: self.secret.clone(),
            access_host: self.access_host.clone(),
            manifest_dir: self.manifest_dir.clone(),
            port: self.port,
        }
    }
}

/// Identifies an existing VM
#[derive(Args, Debug)]
struct VmArgs {
    /// Namespace the VM lives in
    #[arg(long)]
    namespace: String,

    /// VM name
    name: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ControllerConfig::try_from(cli.controller)?;

    init_telemetry(TelemetryConfig {
        json: config.log_json,
    })?;

    match cli.command {
        Commands::Render(args) => run_render(&config, &args),
        Commands::Provision(args) => run_provision(&config, &args).await,
        Commands::Stop(args) => run_lifecycle(&config, &args, LifecycleCommand::Stop).await,
        Commands::Start(args) => run_lifecycle(&config, &args, LifecycleCommand::Start).await,
        Commands::Delete(args) => run_lifecycle(&config, &args, LifecycleCommand::Delete).await,
        Commands::Port => run_port(&config).await,
        Commands::Health => run_health(&config).await,
    }
}

async fn connect(config: &ControllerConfig) -> anyhow::Result<Arc<dyn ClusterApi>> {
    let cluster = KubeCluster::connect(&config.client, &OsKubeEnv).await?;
    Ok(Arc::new(cluster))
}

/// Service over a fresh in-memory store
fn build_service(
    config: &ControllerConfig,
    cluster: Arc<dyn ClusterApi>,
    manifest_dir: PathBuf,
) -> VmService {
    let repository: Arc<dyn VmRepository> = Arc::new(InMemoryVmRepository::new());
    let lifecycle = Arc::new(VmLifecycle::new(
        cluster.clone(),
        repository.clone(),
        config.poll,
    ));
    let (dispatcher, _pool) =
        LifecycleDispatcher::spawn(lifecycle, config.lifecycle_workers, config.lifecycle_queue);
    let provisioner = Provisioner::new(cluster.clone(), config.init_manifest_dir.clone());
    VmService::new(
        cluster,
        repository,
        provisioner,
        dispatcher,
        manifest_dir,
        config.default_image.clone(),
    )
}

fn run_render(config: &ControllerConfig, args: &ProvisionArgs) -> anyhow::Result<()> {
    let request = args.request();
    guard::check(&request)?;

    let documents = if args.typed {
        let image = args.image.as_deref().unwrap_or(&config.default_image);
        VmResourceBuilder::new(&request, image).build()?
    } else {
        manifest::load_dir(&request.manifest_dir, &Substitutions::for_vm(&request))?
    };

    for document in &documents {
        println!("---");
        println!(
            "# {} {} from {}",
            document.api_version(),
            document.name(),
            document.source.display()
        );
        println!("{}", serde_json::to_string_pretty(&document.object)?);
    }
    Ok(())
}

async fn run_provision(config: &ControllerConfig, args: &ProvisionArgs) -> anyhow::Result<()> {
    let request = args.request();
    let cluster = connect(config).await?;
    let service = build_service(config, cluster, request.manifest_dir.clone());

    let result = if args.typed {
        service
            .create_typed_user_vm(&request, args.image.as_deref())
            .await?
    } else {
        service.create_user_vm(&request).await?
    };
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[derive(Clone, Copy, Debug)]
enum LifecycleCommand {
    Stop,
    Start,
    Delete,
}

/// Run one lifecycle operation to completion against a transient record
async fn run_lifecycle(
    config: &ControllerConfig,
    args: &VmArgs,
    command: LifecycleCommand,
) -> anyhow::Result<()> {
    let cluster = connect(config).await?;
    let repository = Arc::new(InMemoryVmRepository::new());
    let vm: VirtualMachine = repository
        .create(NewVirtualMachine {
            owner_id: 0,
            name: args.name.clone(),
            namespace: args.namespace.clone(),
            node_port: 0,
            secret: String::new(),
            image: String::new(),
        })
        .await?;

    let lifecycle = VmLifecycle::new(cluster, repository.clone(), config.poll);
    match command {
        LifecycleCommand::Stop => lifecycle.stop(&vm).await?,
        LifecycleCommand::Start => lifecycle.start(&vm).await?,
        LifecycleCommand::Delete => lifecycle.delete(&vm).await?,
    }

    match repository.find_by_name(&vm.name).await? {
        Some(vm) => println!("{}: {}", vm.name, vm.status),
        None => println!("{}: deleted", vm.name),
    }
    Ok(())
}

async fn run_port(config: &ControllerConfig) -> anyhow::Result<()> {
    let cluster = connect(config).await?;
    let allocator = PortAllocator::new(Arc::new(InMemoryVmRepository::new()));
    println!("{}", allocator.available_cluster_port(cluster.as_ref()).await?);
    Ok(())
}

async fn run_health(config: &ControllerConfig) -> anyhow::Result<()> {
    let health = match connect(config).await {
        Ok(cluster) => {
            build_service(config, cluster, PathBuf::from("yaml-data/client-vm"))
                .check_connectivity()
                .await
        }
        Err(e) => Health::Unhealthy(e.to_string()),
    };
    println!("{}", health);
    match health {
        Health::Healthy => Ok(()),
        Health::Unhealthy(reason) => Err(anyhow::anyhow!("cluster unreachable: {}", reason)),
    }
}
