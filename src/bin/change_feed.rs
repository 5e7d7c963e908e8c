use bson::Bson;
use change_feed::pre_image::PreImageStore;
use change_feed::{
    ChangeFeedService, FeedConfig, MongoCatalog, MongoOplogStore, OpenRequest, ResumeToken,
};
use clap::Parser;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[clap(version = env!("CARGO_PKG_VERSION"), author = env!("CARGO_PKG_AUTHORS"))]
struct Opts {
    /// source database uri, must be a replica set member.  Overrides `src.url` of the config.
    #[clap(short, long)]
    src_uri: Option<String>,
    /// database to watch, the whole cluster is watched when missing.
    #[clap(long)]
    db: Option<String>,
    /// collection to watch, requires `--db`.
    #[clap(long)]
    coll: Option<String>,
    /// configuration file path.
    #[clap(short, long)]
    conf: Option<String>,
    /// log file path, if not specified, all log information will be output to stdout.
    #[clap(long)]
    log_path: Option<String>,
    /// look up the current document of updates.
    #[clap(long)]
    full_document: bool,
    /// report index and collMod events too.
    #[clap(long)]
    show_expanded_events: bool,
    /// resume after this token.
    #[clap(long)]
    resume_after: Option<String>,
}

impl Opts {
    fn open_request(&self, resume_from: Option<ResumeToken>) -> Result<OpenRequest, String> {
        let mut request = match (&self.db, &self.coll) {
            (Some(db), Some(coll)) => OpenRequest::collection(db, coll),
            (Some(db), None) => OpenRequest::database(db),
            (None, None) => OpenRequest::cluster(),
            (None, Some(_)) => return Err("--coll requires --db".to_string()),
        };
        if self.full_document {
            request = request.with_post_images();
        }
        if self.show_expanded_events {
            request = request.with_expanded_events();
        }
        if let Some(token) = resume_from {
            request = request.resume_after(token);
        }
        Ok(request)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opts: Opts = Opts::parse();
    let collector = tracing_subscriber::fmt();
    let (non_blocking, _guard) = match &opts.log_path {
        Some(path) => {
            let path = Path::new(path);
            let dir_name = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .ok_or("log path must name a file")?;
            let file_appender = tracing_appender::rolling::daily(dir_name, file_name);
            tracing_appender::non_blocking(file_appender)
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };
    collector.with_writer(non_blocking).init();

    let config = match &opts.conf {
        Some(path) => FeedConfig::from_toml_str(&fs::read_to_string(path)?)?,
        None => FeedConfig::default(),
    };
    let src_uri = opts
        .src_uri
        .clone()
        .or_else(|| config.get_src_url().map(|url| url.to_string()))
        .ok_or("source uri is required, use --src-uri or `src.url` in the config")?;

    let sleep_time = 10;
    let max_retry_times = 10;
    let mut retry_times = 0;
    let mut resume_from = match &opts.resume_after {
        Some(hex) => Some(ResumeToken::from_document(&bson::doc! {"_data": hex.as_str()})?),
        None => None,
    };

    loop {
        let catalog = MongoCatalog::connect(&src_uri)?;
        let service = ChangeFeedService::new(
            Arc::new(MongoOplogStore::connect(&src_uri)?),
            Arc::new(catalog.clone()),
            Arc::new(catalog),
            Arc::new(PreImageStore::new()),
            config.clone(),
        );
        let _maintenance = service.spawn_maintenance()?;
        let request = opts.open_request(resume_from.clone())?;
        info!(scope = ?request.scope(), "Open change feed.");

        let res = tail(&service, request, &mut resume_from);
        match res {
            Ok(()) => {
                info!("Change feed invalidated, nothing more to watch.");
                break Ok(());
            }
            Err(e) => error!(?e, "Change feed error occurred. "),
        }
        info!(sleep_time, "Wait for a while.....");
        std::thread::sleep(Duration::from_secs(sleep_time));
        if retry_times >= max_retry_times {
            info!(%retry_times, "Retried several times, the server is still down, leaving now.");
            break Ok(());
        }
        retry_times += 1;
    }
}

/// Print events until the feed is invalidated.  Keeps `resume_from` up to date so a failed
/// feed can be reopened where it stopped.
fn tail(
    service: &ChangeFeedService,
    request: OpenRequest,
    resume_from: &mut Option<ResumeToken>,
) -> change_feed::Result<()> {
    let mut batch = service.open(request)?;
    loop {
        for event in batch.events.iter() {
            println!("{}", Bson::Document(event.to_document()));
        }
        *resume_from = Some(batch.post_batch_resume_token.clone());
        if batch.is_exhausted() {
            return Ok(());
        }
        let cursor_id = batch.cursor_id;
        batch = loop {
            match service.get_more(cursor_id, None) {
                Ok(next) => break next,
                Err(e) if e.is_retryable() => {
                    warn!(%cursor_id, error = %e, "Pull failed, retry.");
                    std::thread::sleep(service.config().get_retry_backoff());
                }
                Err(e) => return Err(e),
            }
        };
    }
}
