//! Source registration and trigger attribution.
//!
//! A trigger is evaluated against a single winning source. The event-level
//! and aggregatable tracks then run their own checks against that source and
//! each ends in its own status; only the rate-limit ledger row and the
//! retirement of losing candidates are shared.

use anyhow::{anyhow, Result};
use attribution_storage_core::{
    AggregatableAttributionData, AggregatableHistogramContribution, AggregatableResult,
    AttributionInfo, AttributionLogic, AttributionReport, AttributionTrigger,
    CommonAggregatableData, CreateReportResult, EventLevelData, EventLevelResult,
    EventTriggerData, NullAggregatableData, ReportData, ReportId, ReportType, SchemefulSite,
    StorableSource, StoreSourceResult, StoreSourceStatus, StoredSource, WindowStatus,
};
use log::debug;
use time::OffsetDateTime;

use crate::context::StoreContext;
use crate::rate_limits::{self, RateLimitRecord, RateLimitResult, RateLimitScope};
use crate::{reports, sources};

/// Placeholder id for reports that have not been inserted yet.
const UNASSIGNED_REPORT_ID: ReportId = ReportId(0);

pub(crate) fn store_source(
    ctx: &StoreContext<'_>,
    source: &StorableSource,
) -> Result<StoreSourceResult> {
    for destination in &source.registration.destinations {
        if !rate_limits::source_registration_allowed(ctx, source, destination)? {
            return Ok(StoreSourceResult::rejected(
                StoreSourceStatus::ExcessiveReportingOrigins,
            ));
        }
    }

    let windows = source.registration.effective_event_report_windows();
    let max_event_level_reports = source.max_event_level_reports();
    let randomized_response_rate = ctx.delegate.randomized_response_rate(
        source.source_type,
        &windows,
        max_event_level_reports,
    );
    let response = ctx.delegate.randomized_response(
        source.source_type,
        &windows,
        max_event_level_reports,
        ctx.now,
    );
    let (attribution_logic, fake_reports) = match &response {
        None => (AttributionLogic::Truthfully, &[][..]),
        Some(fakes) if fakes.is_empty() => (AttributionLogic::Never, &[][..]),
        Some(fakes) => (AttributionLogic::Falsely, fakes.as_slice()),
    };

    let evicted_sources = sources::evict_for_capacity(ctx, &source.reporting_origin)?;
    let source_id = sources::insert_source(
        ctx,
        source,
        attribution_logic,
        randomized_response_rate,
        u32::try_from(fake_reports.len()).unwrap_or(u32::MAX),
    )?;

    let source_site = source.source_site();
    for destination in &source.registration.destinations {
        rate_limits::record(
            ctx,
            &RateLimitRecord {
                scope: RateLimitScope::Source,
                source_id,
                source_site: &source_site,
                destination_site: destination,
                context_origin: &source.source_origin,
                reporting_origin: &source.reporting_origin,
            },
        )?;
    }

    let mut min_fake_report_time: Option<OffsetDateTime> = None;
    if !fake_reports.is_empty() {
        let stored = sources::read_source(ctx, source_id)?
            .ok_or_else(|| anyhow!("source {} could not be read back", source_id.0))?;
        for fake in fake_reports {
            let report = AttributionReport {
                id: UNASSIGNED_REPORT_ID,
                attribution_info: AttributionInfo {
                    time: fake.trigger_time,
                    debug_key: None,
                    context_origin: source.source_origin.clone(),
                },
                report_time: fake.report_time,
                initial_report_time: fake.report_time,
                external_report_id: ctx.delegate.new_report_id(),
                failed_send_attempts: 0,
                reporting_origin: source.reporting_origin.clone(),
                data: ReportData::EventLevel(EventLevelData {
                    trigger_data: fake.trigger_data,
                    priority: 0,
                    source: Box::new(stored.clone()),
                }),
            };
            reports::insert_report(ctx.conn, &report)?;
            min_fake_report_time = Some(
                min_fake_report_time.map_or(fake.report_time, |time| time.min(fake.report_time)),
            );
        }
    }

    let status = if response.is_some() {
        StoreSourceStatus::SuccessNoised
    } else {
        StoreSourceStatus::Success
    };
    Ok(StoreSourceResult {
        status,
        source_id: Some(source_id),
        min_fake_report_time,
        evicted_sources,
    })
}

struct EventLevelPlan {
    report: AttributionReport,
    dedup_key: Option<u64>,
    replaced: Option<AttributionReport>,
}

struct AggregatableCandidate {
    contributions: Vec<AggregatableHistogramContribution>,
    dedup_key: Option<u64>,
}

struct AggregatablePlan {
    report: AttributionReport,
    dedup_key: Option<u64>,
    budget_required: i64,
}

pub(crate) fn maybe_create_and_store_report(
    ctx: &StoreContext<'_>,
    trigger: &AttributionTrigger,
) -> Result<CreateReportResult> {
    let registration = &trigger.registration;
    let destination_site = trigger.destination_site();

    let mut event_status = registration
        .event_triggers
        .is_empty()
        .then_some(EventLevelResult::NotRegistered);
    let mut aggregatable_status =
        (!registration.is_aggregatable()).then_some(AggregatableResult::NotRegistered);

    let mut candidates =
        sources::find_matching_sources(ctx, &destination_site, &trigger.reporting_origin)?;
    candidates.sort_by(|a, b| ctx.delegate.compare_sources(a, b));
    let winner = candidates.first().cloned();

    let mut event_plan = None;
    let mut aggregatable_plan = None;

    match &winner {
        None => {
            event_status.get_or_insert(EventLevelResult::NoMatchingImpressions);
            aggregatable_status.get_or_insert(AggregatableResult::NoMatchingImpressions);
        }
        Some(source) if !source.filter_data.matches(source.source_type, &registration.filters) => {
            event_status.get_or_insert(EventLevelResult::NoMatchingSourceFilterData);
            aggregatable_status.get_or_insert(AggregatableResult::NoMatchingSourceFilterData);
        }
        Some(source) => {
            let mut event_trigger = None;
            if event_status.is_none() {
                match event_level_candidate(ctx, trigger, source) {
                    Ok(matched) => event_trigger = Some(matched),
                    Err(status) => event_status = Some(status),
                }
            }
            let mut aggregatable = None;
            if aggregatable_status.is_none() {
                match aggregatable_candidate(ctx, trigger, source) {
                    Ok(candidate) => aggregatable = Some(candidate),
                    Err(status) => aggregatable_status = Some(status),
                }
            }

            if event_trigger.is_some() || aggregatable.is_some() {
                let rate_limit = rate_limits::attribution_allowed(
                    ctx,
                    source,
                    &destination_site,
                    &trigger.reporting_origin,
                )?;
                let (event_rejection, aggregatable_rejection) = match rate_limit {
                    RateLimitResult::Allowed => (None, None),
                    RateLimitResult::NotAllowed => (
                        Some(EventLevelResult::ExcessiveAttributions),
                        Some(AggregatableResult::ExcessiveAttributions),
                    ),
                    RateLimitResult::ExcessiveReportingOrigins => (
                        Some(EventLevelResult::ExcessiveReportingOrigins),
                        Some(AggregatableResult::ExcessiveReportingOrigins),
                    ),
                };
                if let Some(status) = event_rejection {
                    if event_trigger.take().is_some() {
                        event_status = Some(status);
                    }
                }
                if let Some(status) = aggregatable_rejection {
                    if aggregatable.take().is_some() {
                        aggregatable_status = Some(status);
                    }
                }
            }

            if let Some(matched) = event_trigger {
                match plan_event_level(ctx, trigger, source, &destination_site, matched)? {
                    Ok(plan) => event_plan = Some(plan),
                    Err(status) => event_status = Some(status),
                }
            }
            if let Some(candidate) = aggregatable {
                match plan_aggregatable(ctx, trigger, source, &destination_site, candidate)? {
                    Ok(plan) => aggregatable_plan = Some(plan),
                    Err(status) => aggregatable_status = Some(status),
                }
            }
        }
    }

    let mut new_event_level_report = None;
    let mut replaced_event_level_report = None;
    let mut real_aggregatable_report = None;

    if let Some(source) = &winner {
        if let Some(plan) = event_plan {
            let EventLevelPlan {
                mut report,
                dedup_key,
                replaced,
            } = plan;
            match &replaced {
                Some(old) => {
                    reports::delete_report(ctx.conn, old.id)?;
                }
                None => sources::record_event_level_attribution(ctx.conn, source)?,
            }
            report.id = reports::insert_report(ctx.conn, &report)?;
            if let Some(key) = dedup_key {
                sources::store_dedup_key(ctx.conn, source.source_id, ReportType::EventLevel, key)?;
            }
            event_status = Some(if replaced.is_some() {
                EventLevelResult::SuccessDroppedLowerPriority
            } else {
                EventLevelResult::Success
            });
            new_event_level_report = Some(report);
            replaced_event_level_report = replaced;
        }

        if let Some(plan) = aggregatable_plan {
            sources::record_aggregatable_attribution(
                ctx.conn,
                source.source_id,
                plan.budget_required,
            )?;
            if let Some(key) = plan.dedup_key {
                sources::store_dedup_key(
                    ctx.conn,
                    source.source_id,
                    ReportType::AggregatableAttribution,
                    key,
                )?;
            }
            aggregatable_status = Some(AggregatableResult::Success);
            real_aggregatable_report = Some(plan.report);
        }

        if new_event_level_report.is_some() || real_aggregatable_report.is_some() {
            rate_limits::record(
                ctx,
                &RateLimitRecord {
                    scope: RateLimitScope::Attribution,
                    source_id: source.source_id,
                    source_site: &source.source_site(),
                    destination_site: &destination_site,
                    context_origin: &trigger.destination_origin,
                    reporting_origin: &trigger.reporting_origin,
                },
            )?;
            sources::retire_superseded(ctx.conn, source.source_id, &candidates)?;
        }
    }

    let mut aggregatable_reports: Vec<AttributionReport> =
        real_aggregatable_report.into_iter().collect();
    if registration.is_aggregatable() {
        let attributed_source_time = winner
            .as_ref()
            .filter(|_| aggregatable_status == Some(AggregatableResult::Success))
            .map(|source| source.source_time);
        for null_report in
            ctx.delegate
                .null_aggregatable_reports(trigger, ctx.now, attributed_source_time)
        {
            aggregatable_reports.push(null_aggregatable_report(
                ctx,
                trigger,
                null_report.fake_source_time,
            ));
        }
    }
    assign_verifications(ctx, trigger, &mut aggregatable_reports);

    let mut new_aggregatable_report = None;
    let mut min_null_aggregatable_report_time: Option<OffsetDateTime> = None;
    for mut report in aggregatable_reports {
        report.id = reports::insert_report(ctx.conn, &report)?;
        if report.report_type() == ReportType::NullAggregatable {
            min_null_aggregatable_report_time = Some(
                min_null_aggregatable_report_time
                    .map_or(report.report_time, |time| time.min(report.report_time)),
            );
        } else {
            new_aggregatable_report = Some(report);
        }
    }

    let event_level_status = event_status.unwrap_or(EventLevelResult::InternalError);
    let aggregatable_status = aggregatable_status.unwrap_or(AggregatableResult::InternalError);
    debug!(
        "event=trigger_processed event_level_status={} aggregatable_status={}",
        event_level_status.as_str(),
        aggregatable_status.as_str()
    );

    let mut result = CreateReportResult::new(event_level_status, aggregatable_status);
    result.min_null_aggregatable_report_time = min_null_aggregatable_report_time;
    result.new_event_level_report = new_event_level_report;
    result.new_aggregatable_report = new_aggregatable_report;
    result.replaced_event_level_report = replaced_event_level_report;
    Ok(result)
}

/// Checks that need no storage access: configuration match, dedup, report
/// window and the source's noise decision.
fn event_level_candidate<'t>(
    ctx: &StoreContext<'_>,
    trigger: &'t AttributionTrigger,
    source: &StoredSource,
) -> Result<&'t EventTriggerData, EventLevelResult> {
    let event_trigger = trigger
        .registration
        .event_triggers
        .iter()
        .find(|candidate| {
            source
                .filter_data
                .matches(source.source_type, &candidate.filters)
        })
        .ok_or(EventLevelResult::NoMatchingConfigurations)?;

    if let Some(key) = event_trigger.dedup_key {
        if source.dedup_keys.contains(&key) {
            return Err(EventLevelResult::Deduplicated);
        }
    }

    match source
        .event_report_windows
        .status_for(ctx.now - source.source_time)
    {
        WindowStatus::NotStarted => return Err(EventLevelResult::ReportWindowNotStarted),
        WindowStatus::Passed => return Err(EventLevelResult::ReportWindowPassed),
        WindowStatus::Within { .. } => {}
    }

    match source.attribution_logic {
        AttributionLogic::Never => Err(EventLevelResult::DroppedForNoise),
        AttributionLogic::Falsely => Err(EventLevelResult::FalselyAttributedSource),
        AttributionLogic::Truthfully => Ok(event_trigger),
    }
}

fn plan_event_level(
    ctx: &StoreContext<'_>,
    trigger: &AttributionTrigger,
    source: &StoredSource,
    destination_site: &SchemefulSite,
    event_trigger: &EventTriggerData,
) -> Result<Result<EventLevelPlan, EventLevelResult>> {
    let max_reports = ctx
        .delegate
        .max_reports_per_destination(ReportType::EventLevel);
    if reports::count_for_destination(ctx.conn, ReportType::EventLevel, destination_site)?
        >= max_reports
    {
        return Ok(Err(EventLevelResult::NoCapacityForConversionDestination));
    }

    let report_time = ctx.delegate.event_level_report_time(source, ctx.now);
    let mut replaced = None;
    if source.num_attributions >= source.max_event_level_reports {
        let Some(lowest) = reports::lowest_priority_event_report(ctx, source, report_time)? else {
            return Ok(Err(EventLevelResult::ExcessiveReports));
        };
        let lowest_priority = match &lowest.data {
            ReportData::EventLevel(data) => data.priority,
            ReportData::AggregatableAttribution(_) | ReportData::NullAggregatable(_) => i64::MAX,
        };
        if event_trigger.priority <= lowest_priority {
            return Ok(Err(EventLevelResult::PriorityTooLow));
        }
        replaced = Some(lowest);
    }

    let report = AttributionReport {
        id: UNASSIGNED_REPORT_ID,
        attribution_info: attribution_info(ctx, trigger),
        report_time,
        initial_report_time: report_time,
        external_report_id: ctx.delegate.new_report_id(),
        failed_send_attempts: 0,
        reporting_origin: trigger.reporting_origin.clone(),
        data: ReportData::EventLevel(EventLevelData {
            trigger_data: event_trigger.data % source.source_type.trigger_data_cardinality(),
            priority: event_trigger.priority,
            source: Box::new(source.clone()),
        }),
    };

    Ok(Ok(EventLevelPlan {
        report,
        dedup_key: event_trigger.dedup_key,
        replaced,
    }))
}

fn aggregatable_candidate(
    ctx: &StoreContext<'_>,
    trigger: &AttributionTrigger,
    source: &StoredSource,
) -> Result<AggregatableCandidate, AggregatableResult> {
    let registration = &trigger.registration;
    if ctx.now >= source.aggregatable_report_window_time {
        return Err(AggregatableResult::ReportWindowPassed);
    }

    let dedup_key = registration
        .aggregatable_dedup_keys
        .iter()
        .find(|candidate| {
            source
                .filter_data
                .matches(source.source_type, &candidate.filters)
        })
        .and_then(|candidate| candidate.dedup_key);
    if let Some(key) = dedup_key {
        if source.aggregatable_dedup_keys.contains(&key) {
            return Err(AggregatableResult::Deduplicated);
        }
    }

    let contributions = histogram_contributions(trigger, source);
    if contributions.is_empty() {
        return Err(AggregatableResult::NoHistograms);
    }

    Ok(AggregatableCandidate {
        contributions,
        dedup_key,
    })
}

/// One contribution per source key that has a trigger value; matching trigger
/// key pieces are OR-ed into the source key.
fn histogram_contributions(
    trigger: &AttributionTrigger,
    source: &StoredSource,
) -> Vec<AggregatableHistogramContribution> {
    let registration = &trigger.registration;
    source
        .aggregation_keys
        .iter()
        .filter_map(|(key_id, source_key)| {
            let value = *registration.aggregatable_values.get(key_id)?;
            let key = registration
                .aggregatable_trigger_data
                .iter()
                .filter(|data| {
                    data.source_keys.contains(key_id)
                        && source.filter_data.matches(source.source_type, &data.filters)
                })
                .fold(*source_key, |key, data| key.combine(data.key_piece));
            Some(AggregatableHistogramContribution { key, value })
        })
        .collect()
}

fn plan_aggregatable(
    ctx: &StoreContext<'_>,
    trigger: &AttributionTrigger,
    source: &StoredSource,
    destination_site: &SchemefulSite,
    candidate: AggregatableCandidate,
) -> Result<Result<AggregatablePlan, AggregatableResult>> {
    let max_reports = ctx
        .delegate
        .max_reports_per_destination(ReportType::AggregatableAttribution);
    if reports::count_for_destination(
        ctx.conn,
        ReportType::AggregatableAttribution,
        destination_site,
    )? >= max_reports
    {
        return Ok(Err(AggregatableResult::NoCapacityForConversionDestination));
    }

    let existing = usize::try_from(source.num_aggregatable_reports).unwrap_or(usize::MAX);
    if existing >= ctx.delegate.max_aggregatable_reports_per_source() {
        return Ok(Err(AggregatableResult::ExcessiveReports));
    }

    let data = AggregatableAttributionData {
        common: CommonAggregatableData {
            aggregation_coordinator_origin: trigger
                .registration
                .aggregation_coordinator_origin
                .clone(),
            verification_token: None,
            source_registration_time_config: trigger
                .registration
                .source_registration_time_config,
        },
        contributions: candidate.contributions,
        source: Box::new(source.clone()),
    };
    let budget_required = data.budget_required();
    let remaining = ctx
        .aggregatable_budget()
        .saturating_sub(source.aggregatable_budget_consumed);
    if budget_required > remaining {
        return Ok(Err(AggregatableResult::InsufficientBudget));
    }

    let report_time = ctx.delegate.aggregatable_report_time(ctx.now);
    let report = AttributionReport {
        id: UNASSIGNED_REPORT_ID,
        attribution_info: attribution_info(ctx, trigger),
        report_time,
        initial_report_time: report_time,
        external_report_id: ctx.delegate.new_report_id(),
        failed_send_attempts: 0,
        reporting_origin: trigger.reporting_origin.clone(),
        data: ReportData::AggregatableAttribution(data),
    };

    Ok(Ok(AggregatablePlan {
        report,
        dedup_key: candidate.dedup_key,
        budget_required,
    }))
}

fn attribution_info(ctx: &StoreContext<'_>, trigger: &AttributionTrigger) -> AttributionInfo {
    AttributionInfo {
        time: ctx.now,
        debug_key: trigger.registration.debug_key,
        context_origin: trigger.destination_origin.clone(),
    }
}

fn null_aggregatable_report(
    ctx: &StoreContext<'_>,
    trigger: &AttributionTrigger,
    fake_source_time: OffsetDateTime,
) -> AttributionReport {
    let report_time = ctx.delegate.aggregatable_report_time(ctx.now);
    AttributionReport {
        id: UNASSIGNED_REPORT_ID,
        attribution_info: attribution_info(ctx, trigger),
        report_time,
        initial_report_time: report_time,
        external_report_id: ctx.delegate.new_report_id(),
        failed_send_attempts: 0,
        reporting_origin: trigger.reporting_origin.clone(),
        data: ReportData::NullAggregatable(NullAggregatableData {
            common: CommonAggregatableData {
                aggregation_coordinator_origin: trigger
                    .registration
                    .aggregation_coordinator_origin
                    .clone(),
                verification_token: None,
                source_registration_time_config: trigger
                    .registration
                    .source_registration_time_config,
            },
            fake_source_time,
        }),
    }
}

/// Pairs the delegate-ordered aggregatable reports with the delegate-ordered
/// verification tokens. Reports without a token keep their generated id.
fn assign_verifications(
    ctx: &StoreContext<'_>,
    trigger: &AttributionTrigger,
    reports: &mut [AttributionReport],
) {
    if !ctx.config.verification_enabled || trigger.verifications.is_empty() || reports.is_empty()
    {
        return;
    }

    ctx.delegate.shuffle_reports(reports);
    let mut verifications = trigger.verifications.clone();
    ctx.delegate.shuffle_verifications(&mut verifications);

    for (report, verification) in reports.iter_mut().zip(verifications) {
        let common = match &mut report.data {
            ReportData::AggregatableAttribution(data) => &mut data.common,
            ReportData::NullAggregatable(data) => &mut data.common,
            ReportData::EventLevel(_) => continue,
        };
        common.verification_token = Some(verification.token);
        report.external_report_id = verification.aggregatable_report_id;
    }
}
