use std::sync::Arc;

use log::info;
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(name = "synod-node")]
struct Opt {
    /// Total number of participants
    #[structopt(short = "c", long = "count", default_value = "3")]
    count: usize,

    /// Time allowed for each proposal to resolve (in milliseconds)
    #[structopt(short = "t", long = "timeout", default_value = "1000")]
    timeout: u64,

    /// Directory holding participant logs. Logs are kept in memory if absent.
    #[structopt(short = "d", long = "data", parse(from_os_str))]
    data: Option<std::path::PathBuf>,

    /// Additional pipelines to read, assigned to participants in turn
    #[structopt(short = "p", long = "pipeline")]
    pipelines: Vec<synod::PipelineId>,

    /// Log level
    #[structopt(short = "l", long = "level", default_value = "info")]
    level: log::LevelFilter,

    /// Proposals as KEY=VALUE, sent to participants round-robin
    proposals: Vec<Proposal>,
}

struct Proposal {
    key: String,
    value: String,
}

impl std::str::FromStr for Proposal {
    type Err = String;
    fn from_str(proposal: &str) -> Result<Self, Self::Err> {
        let mut split = proposal.splitn(2, '=');
        match (split.next(), split.next()) {
        | (Some(key), Some(value)) if !key.is_empty() => Ok(Proposal {
            key: key.to_string(),
            value: value.to_string(),
        }),
        | _ => Err(format!("expected KEY=VALUE, found {:?}", proposal)),
        }
    }
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();
    if opt.count == 0 {
        eprintln!("[USAGE ERROR]: count must be positive");
        std::process::exit(2);
    }

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!("[{}][{}] {}", record.level(), record.target(), message))
        })
        .level(opt.level)
        .chain(std::io::stderr())
        .apply()
        .expect("[INTERNAL ERROR]: could not install logger");

    let config = synod::Config::<String, String>::new(opt.count)
        .with_timeout(std::time::Duration::from_millis(opt.timeout))
        .with_pipelines(opt.pipelines.clone());

    let system = match &opt.data {
    | Some(dir) => synod::System::file(config, dir)
        .expect("[STORAGE ERROR]: could not open participant logs"),
    | None => synod::System::memory(config),
    };

    let running = synod::runner::spawn(Arc::new(system));
    let pipelines = running.system().config().pipelines().to_vec();
    for participant in running.system().participants() {
        participant.change_pipeline(pipelines[participant.uid() % pipelines.len()]);
    }

    let decisions = opt.proposals
        .iter()
        .enumerate()
        .map(|(index, proposal)| {
            running.propose_value(index % opt.count, proposal.key.clone(), proposal.value.clone())
        });

    for (proposal, decision) in opt.proposals.iter().zip(futures::future::join_all(decisions).await) {
        match decision {
        | Ok(value) => println!("{}={}", proposal.key, value),
        | Err(error) => println!("{}: {}", proposal.key, error),
        }
    }

    info!("Shutting down");
    if let Err(error) = running.shutdown().await {
        eprintln!("[INTERNAL ERROR]: {}", error);
        std::process::exit(1);
    }
}
