use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use colored::*;
use crossterm::event::{Event, EventStream, KeyCode, KeyEvent, KeyModifiers};
use crossterm::terminal;
use dialoguer::Select;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::domain;
use crate::imds::{self, Metadata};
use crate::r53::{self, AutoAttachment, PrivateHostedZone, ResourceRecord};
use crate::{
    format_duration, print_debug, print_error, print_info, print_success, print_warning,
};

pub struct Options {
    pub r53: Arc<r53::Client>,
    pub imds: Arc<imds::Client>,
    pub hosted_zone_id: Option<String>,
    pub domain_name: Option<String>,
    pub auto_attach: bool,
    pub profile: Option<String>,
    pub region: Option<String>,
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingIdentity,
    SelectingZone,
    Connecting,
    Connected,
}

/// Completion messages delivered back into the session loop. Each network
/// operation runs as a spawned task and reports through exactly one of these
enum Msg {
    IdentityResolved(Metadata),
    IdentityFailed(anyhow::Error),
    ZoneAttached {
        zone: PrivateHostedZone,
        attachment: AutoAttachment,
    },
    ZoneResolved(PrivateHostedZone),
    ZonesListed(Vec<PrivateHostedZone>),
    ZoneSelected(PrivateHostedZone),
    RecordPublished,
    OperationFailed {
        reason: String,
        cause: anyhow::Error,
    },
    Quit,
}

/// Side effects requested by the reducer, executed by the loop as spawned
/// tasks that feed a [`Msg`] back in on completion
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    FetchIdentity,
    AutoAttach { vpc: String, region: String },
    LookupZone { id: String },
    ListZones { vpc: String, region: String },
    PromptSelection { zones: Vec<PrivateHostedZone> },
    PublishRecord { record: ResourceRecord },
}

/// Best-effort work to perform on the way out. Retraction is only ever
/// planned once the publish completion has been processed
#[derive(Debug, Clone, PartialEq, Eq)]
struct CleanupPlan {
    retract: Option<ResourceRecord>,
    attachment: Option<AutoAttachment>,
}

enum Step {
    Continue(Vec<Command>),
    Shutdown(CleanupPlan),
    Fatal(anyhow::Error),
}

struct Session {
    phase: Phase,
    auto_attach: bool,
    hosted_zone_id: Option<String>,
    domain_template: Option<String>,
    metadata: Option<Metadata>,
    custom_domain: Option<String>,
    selected: Option<PrivateHostedZone>,
    domain_name: Option<String>,
    attachment: Option<AutoAttachment>,
    connected_at: Option<Instant>,
    error: Option<String>,
}

impl Session {
    fn new(opts: &Options) -> Self {
        Self {
            phase: Phase::AwaitingIdentity,
            auto_attach: opts.auto_attach,
            hosted_zone_id: opts.hosted_zone_id.clone(),
            domain_template: opts.domain_name.clone(),
            metadata: None,
            custom_domain: None,
            selected: None,
            domain_name: None,
            attachment: None,
            connected_at: None,
            error: None,
        }
    }

    fn is_connected(&self) -> bool {
        self.phase == Phase::Connected
    }

    /// Advances the session state for a single message, returning the side
    /// effects to run next. All session state is owned by the loop; this is
    /// the only place it mutates
    fn update(&mut self, msg: Msg) -> Step {
        match msg {
            Msg::IdentityResolved(mut metadata) => {
                if self.phase != Phase::AwaitingIdentity {
                    return Step::Continue(Vec::new());
                }

                // Template errors are user-input errors and must surface
                // before any mutating call is issued
                if let Some(template) = self.domain_template.clone() {
                    domain::clean_tags(&mut metadata.tags);
                    match domain::resolve_domain_name(&template, &metadata) {
                        Ok(resolved) => self.custom_domain = Some(resolved),
                        Err(err) => return Step::Fatal(err),
                    }
                }

                self.phase = Phase::SelectingZone;
                let command = if self.auto_attach {
                    Command::AutoAttach {
                        vpc: metadata.vpc.clone(),
                        region: metadata.region.clone(),
                    }
                } else if let Some(id) = self.hosted_zone_id.clone() {
                    Command::LookupZone { id }
                } else {
                    Command::ListZones {
                        vpc: metadata.vpc.clone(),
                        region: metadata.region.clone(),
                    }
                };

                self.metadata = Some(metadata);
                Step::Continue(vec![command])
            }
            Msg::IdentityFailed(err) => Step::Fatal(err),
            Msg::ZoneAttached { zone, attachment } => {
                if self.phase != Phase::SelectingZone {
                    return Step::Continue(Vec::new());
                }

                self.attachment = Some(attachment);
                self.select_zone(zone)
            }
            Msg::ZoneResolved(zone) | Msg::ZoneSelected(zone) => {
                if self.phase != Phase::SelectingZone {
                    return Step::Continue(Vec::new());
                }

                self.select_zone(zone)
            }
            Msg::ZonesListed(mut zones) => {
                if self.phase != Phase::SelectingZone {
                    return Step::Continue(Vec::new());
                }

                match zones.len() {
                    0 => {
                        self.error =
                            Some("no private hosted zones are associated with this VPC".into());
                        Step::Continue(Vec::new())
                    }
                    1 => {
                        let zone = zones.remove(0);
                        self.select_zone(zone)
                    }
                    _ => Step::Continue(vec![Command::PromptSelection { zones }]),
                }
            }
            Msg::RecordPublished => {
                if self.phase != Phase::Connecting {
                    return Step::Continue(Vec::new());
                }

                self.phase = Phase::Connected;
                self.connected_at = Some(Instant::now());
                Step::Continue(Vec::new())
            }
            Msg::OperationFailed { reason, cause } => {
                self.error = Some(format!("{reason}: {cause}"));
                Step::Continue(Vec::new())
            }
            Msg::Quit => {
                let retract = if self.is_connected() {
                    self.active_record()
                } else {
                    None
                };

                Step::Shutdown(CleanupPlan {
                    retract,
                    attachment: self.attachment.take(),
                })
            }
        }
    }

    fn select_zone(&mut self, zone: PrivateHostedZone) -> Step {
        let Some(metadata) = self.metadata.as_ref() else {
            return Step::Continue(Vec::new());
        };

        let name = domain::qualified_domain_name(
            self.custom_domain.as_deref(),
            &metadata.ipv4,
            &zone.name,
        );
        let record = ResourceRecord {
            phz_id: zone.id.clone(),
            name: name.clone(),
            resource: metadata.ipv4.clone(),
        };

        self.domain_name = Some(name);
        self.selected = Some(zone);
        self.phase = Phase::Connecting;

        Step::Continue(vec![Command::PublishRecord { record }])
    }

    fn active_record(&self) -> Option<ResourceRecord> {
        let zone = self.selected.as_ref()?;
        let name = self.domain_name.as_ref()?;
        let metadata = self.metadata.as_ref()?;

        Some(ResourceRecord {
            phz_id: zone.id.clone(),
            name: name.clone(),
            resource: metadata.ipv4.clone(),
        })
    }
}

/// Runs the interactive association session until the user disconnects or an
/// unrecoverable error occurs. Cleanup on the way out is best-effort and
/// never blocks the process from exiting
pub async fn run(opts: Options) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<Msg>(16);
    let mut session = Session::new(&opts);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut keys: Option<EventStream> = None;
    let mut raw_mode = false;

    print_info("retrieving EC2 instance metadata from IMDS...");
    execute(Command::FetchIdentity, &opts, &tx);

    let outcome = loop {
        let msg = tokio::select! {
            maybe = rx.recv() => maybe,
            _ = tokio::signal::ctrl_c(), if !raw_mode => Some(Msg::Quit),
            Some(event) = next_event(&mut keys) => quit_key(&event).then_some(Msg::Quit),
            _ = ticker.tick(), if session.is_connected() => {
                render_elapsed(&session);
                None
            }
        };

        let Some(msg) = msg else {
            continue;
        };

        announce(&msg, &session, opts.verbose);
        let was_publish = matches!(msg, Msg::RecordPublished);

        match session.update(msg) {
            Step::Continue(commands) => {
                for command in commands {
                    execute(command, &opts, &tx);
                }

                if was_publish && session.is_connected() {
                    announce_connected(&session);
                    match terminal::enable_raw_mode() {
                        Ok(()) => {
                            raw_mode = true;
                            keys = Some(EventStream::new());
                        }
                        Err(err) => print_warning(&format!(
                            "unable to capture key presses, use ctrl+c to disconnect: {err}"
                        )),
                    }
                }
            }
            Step::Shutdown(plan) => break Ok(plan),
            Step::Fatal(err) => break Err(err),
        }
    };

    if raw_mode {
        let _ = terminal::disable_raw_mode();
        eprintln!();
    }

    let plan = outcome?;
    cleanup(&plan, &opts).await;
    print_session_summary(&session, &opts);

    Ok(())
}

fn execute(command: Command, opts: &Options, tx: &mpsc::Sender<Msg>) {
    let tx = tx.clone();

    match command {
        Command::FetchIdentity => {
            let imds = Arc::clone(&opts.imds);
            tokio::spawn(async move {
                let msg = match imds.instance_metadata().await {
                    Ok(metadata) => Msg::IdentityResolved(metadata),
                    Err(err) => Msg::IdentityFailed(err),
                };
                let _ = tx.send(msg).await;
            });
        }
        Command::AutoAttach { vpc, region } => {
            let r53 = Arc::clone(&opts.r53);
            tokio::spawn(async move {
                let msg = match r53
                    .auto_attach_to_zone(domain::DEFAULT_ZONE_NAME, &vpc, &region)
                    .await
                {
                    Ok((zone, attachment)) => Msg::ZoneAttached { zone, attachment },
                    Err(cause) => Msg::OperationFailed {
                        reason: format!(
                            "attaching to the {} private hosted zone",
                            domain::DEFAULT_ZONE_NAME
                        ),
                        cause,
                    },
                };
                let _ = tx.send(msg).await;
            });
        }
        Command::LookupZone { id } => {
            let r53 = Arc::clone(&opts.r53);
            tokio::spawn(async move {
                let msg = match r53.by_id(&id).await {
                    Ok(zone) => Msg::ZoneResolved(zone),
                    Err(cause) => Msg::OperationFailed {
                        reason: format!("querying private hosted zone {id}"),
                        cause,
                    },
                };
                let _ = tx.send(msg).await;
            });
        }
        Command::ListZones { vpc, region } => {
            let r53 = Arc::clone(&opts.r53);
            tokio::spawn(async move {
                let msg = match r53.by_vpc(&vpc, &region).await {
                    Ok(zones) => Msg::ZonesListed(zones),
                    Err(cause) => Msg::OperationFailed {
                        reason: format!("querying private hosted zones for VPC {vpc}"),
                        cause,
                    },
                };
                let _ = tx.send(msg).await;
            });
        }
        Command::PromptSelection { zones } => {
            tokio::task::spawn_blocking(move || {
                let items: Vec<String> = zones
                    .iter()
                    .map(|zone| format!("{} ({})", zone.name, zone.id))
                    .collect();

                let choice = Select::new()
                    .with_prompt("Please select a private hosted zone")
                    .items(&items)
                    .default(0)
                    .interact_opt();

                let msg = match choice {
                    Ok(Some(index)) => Msg::ZoneSelected(zones[index].clone()),
                    Ok(None) | Err(_) => Msg::Quit,
                };
                let _ = tx.blocking_send(msg);
            });
        }
        Command::PublishRecord { record } => {
            let r53 = Arc::clone(&opts.r53);
            tokio::spawn(async move {
                let msg = match r53.associate_record(&record).await {
                    Ok(()) => Msg::RecordPublished,
                    Err(cause) => Msg::OperationFailed {
                        reason: format!("creating record {}", record.name),
                        cause,
                    },
                };
                let _ = tx.send(msg).await;
            });
        }
    }
}

async fn next_event(keys: &mut Option<EventStream>) -> Option<Event> {
    match keys.as_mut() {
        Some(stream) => stream.next().await.and_then(|event| event.ok()),
        None => futures::future::pending().await,
    }
}

fn quit_key(event: &Event) -> bool {
    match event {
        Event::Key(KeyEvent {
            code: KeyCode::Char('q') | KeyCode::Esc,
            ..
        }) => true,
        Event::Key(KeyEvent {
            code: KeyCode::Char('c'),
            modifiers,
            ..
        }) => modifiers.contains(KeyModifiers::CONTROL),
        _ => false,
    }
}

fn announce(msg: &Msg, session: &Session, verbose: bool) {
    match msg {
        Msg::IdentityResolved(metadata) => {
            print_success(&format!("discovered EC2 instance {}", metadata.instance_id));
            print_debug(
                &format!(
                    "IPv4: {}  VPC: {}  AZ: {}",
                    metadata.ipv4, metadata.vpc, metadata.az
                ),
                verbose,
            );

            if session.auto_attach {
                print_info(&format!(
                    "attaching to the {} private hosted zone...",
                    domain::DEFAULT_ZONE_NAME
                ));
            } else if session.hosted_zone_id.is_some() {
                print_info("retrieving the requested private hosted zone...");
            } else {
                print_info("retrieving private hosted zones associated with this VPC...");
            }
        }
        Msg::ZoneAttached { zone, attachment } => {
            if attachment.created_phz {
                print_success(&format!(
                    "created private hosted zone {} ({})",
                    zone.name, zone.id
                ));
            } else {
                print_success(&format!(
                    "associated VPC with private hosted zone {} ({})",
                    zone.name, zone.id
                ));
            }
        }
        Msg::ZoneResolved(zone) | Msg::ZoneSelected(zone) => {
            print_info(&format!(
                "using private hosted zone {} ({})",
                zone.name, zone.id
            ));
        }
        Msg::ZonesListed(zones) if zones.is_empty() => {
            print_error("no private hosted zones are associated with this VPC");
        }
        Msg::ZonesListed(zones) => {
            print_info(&format!("found {} private hosted zones", zones.len()));
        }
        Msg::OperationFailed { reason, cause } => {
            print_error(&format!("{reason}: {cause}"));
        }
        Msg::IdentityFailed(_) | Msg::RecordPublished | Msg::Quit => {}
    }
}

fn announce_connected(session: &Session) {
    if let (Some(name), Some(metadata)) = (session.domain_name.as_ref(), session.metadata.as_ref())
    {
        print_success(&format!(
            "created A record {} -> {} (TTL {}s)",
            name.green(),
            metadata.ipv4,
            r53::RECORD_TTL
        ));
        print_info("press q or ctrl+c to disconnect and clean up");
    }
}

fn render_elapsed(session: &Session) {
    if let (Some(name), Some(connected_at)) =
        (session.domain_name.as_ref(), session.connected_at)
    {
        eprint!(
            "\r{} {} active ({})   ",
            "[CONNECTED]".green().bold(),
            name,
            format_duration(connected_at.elapsed())
        );
    }
}

async fn cleanup(plan: &CleanupPlan, opts: &Options) {
    if let Some(record) = &plan.retract {
        match opts.r53.disassociate_record(record).await {
            Ok(()) => print_info(&format!("deleted record {}", record.name)),
            Err(err) => print_warning(&format!(
                "failed to delete record {}: {err}",
                record.name
            )),
        }
    }

    if let Some(attachment) = &plan.attachment {
        match opts.r53.remove_attachment_to_zone(attachment).await {
            Ok(()) if attachment.created_phz => print_info(&format!(
                "deleted the {} private hosted zone",
                domain::DEFAULT_ZONE_NAME
            )),
            Ok(()) => print_info(&format!(
                "disassociated this VPC from the {} private hosted zone",
                domain::DEFAULT_ZONE_NAME
            )),
            Err(err) => print_warning(&format!(
                "failed to detach from private hosted zone {}: {err}",
                attachment.phz_id
            )),
        }
    }
}

fn print_session_summary(session: &Session, opts: &Options) {
    let Some(zone) = session.selected.as_ref() else {
        return;
    };

    eprintln!();

    let border = "━".repeat(75).blue();
    eprintln!("{border}");
    eprintln!("{}", "SESSION SUMMARY".green().bold());
    eprintln!("{border}");

    eprintln!("{}", "Private Hosted Zone:".yellow().bold());
    eprintln!("  • Name: {}", zone.name);
    eprintln!("  • ID: {}", zone.id.green());
    eprintln!();

    eprintln!("{}", "DNS Record:".yellow().bold());
    eprintln!(
        "  • Name: {} [A]",
        session.domain_name.as_deref().unwrap_or("N/A").green()
    );
    eprintln!(
        "  • Value: {}",
        session
            .metadata
            .as_ref()
            .map(|metadata| metadata.ipv4.as_str())
            .unwrap_or("N/A")
    );
    if let Some(connected_at) = session.connected_at {
        eprintln!(
            "  • Duration: {}",
            format_duration(connected_at.elapsed()).green()
        );
    }
    if let Some(error) = &session.error {
        eprintln!("  • Last error: {}", error.red());
    }
    eprintln!();

    eprintln!(
        "  • Profile: {}",
        opts.profile.as_deref().unwrap_or("default")
    );
    eprintln!(
        "  • Region: {}",
        opts.region.as_deref().unwrap_or("default")
    );
    eprintln!("{border}");
}
