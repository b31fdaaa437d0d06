use std::process;

use je_client::{Client, SearchFilter, SearchOptions};
use je_data::State;
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

mod operations;

/// Query jobs of a remote job engine
#[derive(StructOpt, Debug)]
#[structopt(name = "je-client")]
struct Opt {
    /// Base URL of the job engine
    #[structopt(short, long, env = "JE_URL", default_value = "http://localhost:8000")]
    url: String,

    #[structopt(subcommand)]
    operation: Operation,
}

#[derive(Debug, StructOpt)]
enum Operation {
    /// Show a single job
    Get(GetOperation),
    /// List jobs matching the given filters
    Search(SearchOperation),
}

#[derive(Debug, StructOpt)]
struct GetOperation {
    #[structopt(name = "ID")]
    id: u64,
}

#[derive(Debug, StructOpt)]
struct SearchOperation {
    #[structopt(long)]
    name: Option<String>,
    #[structopt(long, parse(try_from_str = parse_state))]
    state: Option<State>,
    #[structopt(long)]
    worker: Option<String>,
}

fn parse_state(raw: &str) -> Result<State, String> {
    serde_json::from_value(serde_json::Value::String(raw.to_ascii_uppercase()))
        .map_err(|_| format!("unknown job state: {}", raw))
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let opt = Opt::from_args();

    let client = match Client::new(&opt.url) {
        Ok(client) => client,
        Err(err) => {
            eprintln!("could not build http client: {}", err);
            process::exit(1);
        }
    };
    let result = match opt.operation {
        Operation::Get(get) => operations::get(&client, get.id),
        Operation::Search(search) => {
            let options = SearchOptions {
                filter: SearchFilter {
                    id: None,
                    name: search.name,
                    state: search.state,
                    worker: search.worker,
                },
            };
            operations::search(&client, &options)
        }
    };
    match result {
        Ok(text) => println!("{}", text),
        Err(err) => {
            eprintln!("{}", err);
            process::exit(1);
        }
    }
}
