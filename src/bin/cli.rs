use clap::Parser;
use rustdis_client::{Client, Command, Config, Error, Hello, ScanOptions, ScanTarget};
use tracing::debug;

const HOST: &str = "127.0.0.1";
const PORT: u16 = 6379;

#[derive(Parser, Debug)]
#[command(about = "Send one command to a Redis server and print the reply")]
struct Args {
    /// Server hostname
    #[arg(short = 'H', long, env = "REDIS_HOST", default_value = HOST)]
    host: String,

    /// Server port
    #[arg(short, long, env = "REDIS_PORT", default_value_t = PORT)]
    port: u16,

    /// Switch the connection to RESP3 with HELLO 3
    #[arg(long)]
    resp3: bool,

    /// List the keys matching a glob pattern instead of running a command
    #[arg(long, value_name = "PATTERN")]
    scan: Option<String>,

    /// COUNT hint used with --scan
    #[arg(long, default_value_t = 100, requires = "scan")]
    count: u64,

    /// Command name and arguments, PING when empty
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| debug!("Failed to initialize global tracing: {}", e));

    let args = Args::parse();

    let mut config = Config::from_env();
    config.host = args.host.clone();
    config.port = args.port;
    config.pool.max_size = 1;
    if args.resp3 {
        config.hello = Some(Hello::default());
    }

    let client = Client::new(config);
    run(&client, args).await
}

async fn run(client: &Client, args: Args) -> Result<(), Error> {
    let result = match args.scan {
        Some(pattern) => scan(client, pattern, args.count).await,
        None => execute(client, &args.command).await,
    };

    client.close();
    result
}

async fn scan(client: &Client, pattern: String, count: u64) -> Result<(), Error> {
    let options = ScanOptions::new().pattern(pattern).count(count);
    let mut scanner = client.scan(ScanTarget::Keys, options).await?;

    let mut n = 0;
    while let Some(key) = scanner.next().await? {
        n += 1;
        println!("{}) \"{}\"", n, String::from_utf8_lossy(&key));
    }
    if n == 0 {
        println!("(empty array)");
    }
    Ok(())
}

async fn execute(client: &Client, command: &[String]) -> Result<(), Error> {
    let cmd = match command.split_first() {
        Some((name, rest)) => Command::new(name).args(rest),
        None => Command::new("PING"),
    };

    match client.execute(&cmd).await {
        Ok(reply) => println!("{}", reply),
        Err(Error::Command(err)) => println!("(error) {}", err),
        Err(err) => return Err(err),
    }
    Ok(())
}
