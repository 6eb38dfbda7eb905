use std::collections::BTreeSet;
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use novel_stream::prelude::*;
use novel_stream::{Chapter, FieldMap, Section, TitleKind};
use tracing::{debug, info, warn};

use crate::render::StreamPrinter;
use crate::{Context, GenerateArgs, SectionArgs};

fn controller(ctx: &Context, granularity: Granularity) -> GenerationController {
    GenerationController::builder(ctx.transport.clone())
        .field_map(FieldMap::for_granularity(granularity))
        .completion_hook(Arc::new(StorePersistence::new(ctx.store.clone())))
        .stream_buffer_capacity(ctx.buffer_capacity)
        .build()
}

/// Where a finished artifact of `agent` is saved. Critiques are never saved.
pub(crate) fn persist_target(
    agent: AgentRole,
    granularity: Granularity,
    project: &str,
    chapter: Option<&Chapter>,
    section_id: Option<&str>,
) -> Result<Option<PersistTarget>, ClientError> {
    let project = project.to_string();
    let need_chapter = || {
        chapter.ok_or_else(|| ClientError::Config(format!("--chapter is required to save {agent} output")))
    };
    let need_section = || {
        section_id
            .map(str::to_string)
            .ok_or_else(|| ClientError::Config(format!("--section is required to save {agent} output")))
    };
    let target = match (agent, granularity) {
        (AgentRole::Reviewer, _) => return Ok(None),
        (AgentRole::Planner, Granularity::Novel) => PersistTarget::ProjectOutline { project },
        (AgentRole::Planner, Granularity::Chapter) => {
            let chapter = need_chapter()?;
            PersistTarget::ChapterOutline {
                project,
                chapter_id: chapter.id.clone(),
                title: chapter.title.clone(),
            }
        }
        (AgentRole::Planner, Granularity::Section) => PersistTarget::SectionOutline {
            project,
            chapter_id: need_chapter()?.id.clone(),
            section_id: need_section()?,
        },
        (AgentRole::Writer, _) => PersistTarget::SectionContent {
            project,
            chapter_id: need_chapter()?.id.clone(),
            section_id: need_section()?,
        },
    };
    Ok(Some(target))
}

enum Step {
    Event(Option<ExchangeEvent>),
    Interrupt,
}

/// Streams one exchange to stdout. Ctrl-C cancels it.
async fn run_exchange(
    controller: &GenerationController,
    request: GenerationRequest,
) -> Result<ExchangeOutcome, ClientError> {
    let handle = controller.start(request)?;
    stream_exchange(
        controller,
        handle,
        tokio::signal::ctrl_c(),
        &mut std::io::stdout(),
    )
    .await
}

/// Renders an exchange to `out` until it ends; `interrupt` resolving cancels it.
///
/// The interrupt future is polled across the whole exchange, so a signal that
/// arrives while output is being written is still observed.
async fn stream_exchange<I: Future>(
    controller: &GenerationController,
    mut handle: ExchangeHandle,
    interrupt: I,
    out: &mut impl Write,
) -> Result<ExchangeOutcome, ClientError> {
    let abort = handle.abort_handle();
    let mut printer = StreamPrinter::default();
    let mut interrupted = false;
    tokio::pin!(interrupt);

    loop {
        let step = tokio::select! {
            event = handle.next_event() => Step::Event(event),
            _ = &mut interrupt, if !interrupted => Step::Interrupt,
        };
        match step {
            Step::Interrupt => {
                interrupted = true;
                eprintln!("\ncanceling {}...", handle.agent());
                abort.abort();
            }
            Step::Event(Some(ExchangeEvent::Folded { change, .. })) => {
                let shown = controller.render(|ledger| printer.show(ledger, change, out));
                if let Err(err) = shown {
                    warn!(error = %err, "failed to write output");
                }
            }
            Step::Event(Some(ExchangeEvent::Skipped { reason, .. })) => {
                debug!(%reason, "frame skipped");
            }
            Step::Event(Some(ExchangeEvent::Started { .. })) => {}
            Step::Event(Some(ExchangeEvent::Finished { .. }) | None) => break,
        }
    }
    let _ = printer.close(out);
    Ok(handle.finish().await?)
}

fn report(outcome: &ExchangeOutcome) -> ExitCode {
    match &outcome.persisted {
        Some(Ok(())) => info!(agent = %outcome.agent, "result saved"),
        Some(Err(err)) => eprintln!("warning: {} result was not saved: {err}", outcome.agent),
        None => {}
    }
    match outcome.state {
        SlotState::Complete => ExitCode::SUCCESS,
        SlotState::Failed => {
            eprintln!(
                "error: {} failed: {}",
                outcome.agent,
                outcome.failure.as_deref().unwrap_or("unknown error")
            );
            ExitCode::FAILURE
        }
        SlotState::Idle | SlotState::Generating => {
            eprintln!("{} canceled", outcome.agent);
            ExitCode::from(130)
        }
    }
}

pub(crate) async fn generate(ctx: &Context, args: GenerateArgs) -> Result<ExitCode, ClientError> {
    let controller = controller(ctx, args.granularity);

    let chapter = match &args.chapter {
        Some(id) => Some(ctx.store.get_chapter(&args.project, id).await?),
        None => None,
    };
    let section = match (&args.chapter, &args.section) {
        (Some(chapter_id), Some(section_id)) => Some(
            ctx.store
                .get_section(&args.project, chapter_id, section_id)
                .await?,
        ),
        _ => None,
    };

    if let Some(requires) = args.agent.prerequisite() {
        let stored = section.as_ref().map(|s| match requires {
            AgentRole::Planner => s.outline.clone(),
            AgentRole::Writer | AgentRole::Reviewer => s.content.clone(),
        });
        if let Some(text) = args.prior.clone().or(stored) {
            controller.seed_artifact(requires, text);
        }
    }

    let mut request = GenerationRequest::new(args.agent, &args.project)
        .granularity(args.granularity)
        .topic(&args.topic);
    if let Some(chapter) = &chapter {
        request = request.chapter(&chapter.id).chapter_title(&chapter.title);
    }
    if let Some(section) = &section {
        request = request.section(&section.id);
    }
    if args.persist {
        match persist_target(
            args.agent,
            args.granularity,
            &args.project,
            chapter.as_ref(),
            args.section.as_deref(),
        )? {
            Some(target) => request = request.persist_to(target),
            None => warn!(agent = %args.agent, "output of this agent is not saved"),
        }
    }
    if !args.topic.trim().is_empty() {
        controller.note_user(&args.topic);
    }

    let outcome = run_exchange(&controller, request).await?;
    Ok(report(&outcome))
}

pub(crate) async fn section(ctx: &Context, args: SectionArgs) -> Result<ExitCode, ClientError> {
    let chapter = ctx.store.get_chapter(&args.project, &args.chapter).await?;
    let section: Section = ctx
        .store
        .get_section(&args.project, &args.chapter, &args.section)
        .await?;
    let controller = controller(ctx, Granularity::Section);

    let planned = !section.outline.trim().is_empty();
    if planned {
        controller.seed_artifact(AgentRole::Planner, &section.outline);
    }
    let mut stages = Vec::with_capacity(3);
    if args.replan || !planned {
        stages.push(AgentRole::Planner);
    }
    stages.extend([AgentRole::Writer, AgentRole::Reviewer]);

    let topic = if args.topic.trim().is_empty() {
        section.title.clone()
    } else {
        args.topic.clone()
    };
    controller.note_user(&topic);

    for agent in stages {
        let mut request = GenerationRequest::new(agent, &args.project)
            .granularity(Granularity::Section)
            .topic(&topic)
            .chapter(&chapter.id)
            .chapter_title(&chapter.title)
            .section(&section.id);
        if let Some(target) = persist_target(
            agent,
            Granularity::Section,
            &args.project,
            Some(&chapter),
            Some(&section.id),
        )? {
            request = request.persist_to(target);
        }
        let outcome = run_exchange(&controller, request).await?;
        let code = report(&outcome);
        if outcome.state != SlotState::Complete {
            return Ok(code);
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Titles not yet present, in outline order and without duplicates.
pub(crate) fn missing_titles<'a>(
    titles: &[String],
    existing: impl IntoIterator<Item = &'a str>,
) -> Vec<String> {
    let mut seen: BTreeSet<&str> = existing.into_iter().map(str::trim).collect();
    titles
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty() && seen.insert(*t))
        .map(str::to_string)
        .collect()
}

pub(crate) async fn chapters(ctx: &Context, project: &str) -> Result<ExitCode, ClientError> {
    let record = ctx.store.get_project(project).await?;
    if record.novel_outline.trim().is_empty() {
        eprintln!("project {project} has no outline yet; generate one with the planner first");
        return Ok(ExitCode::FAILURE);
    }
    let titles = ctx
        .store
        .extract_titles(&record.novel_outline, TitleKind::Chapter)
        .await?;
    let existing = ctx.store.list_chapters(project).await?;
    let missing = missing_titles(&titles, existing.iter().map(|c| c.title.as_str()));
    info!(project, found = titles.len(), new = missing.len(), "extracted chapter titles");
    for title in missing {
        let chapter = ctx.store.create_chapter(project, &title, "").await?;
        println!("{}\t{}", chapter.id, chapter.title);
    }
    Ok(ExitCode::SUCCESS)
}

pub(crate) async fn sections(
    ctx: &Context,
    project: &str,
    chapter_id: &str,
) -> Result<ExitCode, ClientError> {
    let chapter = ctx.store.get_chapter(project, chapter_id).await?;
    if chapter.outline.trim().is_empty() {
        eprintln!("chapter {} has no outline yet; plan it first", chapter.title);
        return Ok(ExitCode::FAILURE);
    }
    let titles = ctx
        .store
        .extract_titles(&chapter.outline, TitleKind::Section)
        .await?;
    let existing = ctx.store.list_sections(project, chapter_id).await?;
    let missing = missing_titles(&titles, existing.iter().map(|s| s.title.as_str()));
    info!(project, chapter = chapter_id, found = titles.len(), new = missing.len(), "extracted section titles");
    for title in missing {
        let section = ctx.store.create_section(project, chapter_id, &title).await?;
        println!("{}\t{}", section.id, section.title);
    }
    Ok(ExitCode::SUCCESS)
}
