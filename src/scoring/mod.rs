use anyhow::{bail, Result};
use futures_util::future::{self, BoxFuture};
use tracing::instrument;

use crate::entities::{
    EffectiveLimits, JudgingPlan, ProblemType, ScoringType, SubmissionStatus, Subtask,
    TestcaseStatus,
};

/// Distributes weights over `explicit` entries: explicit values are honored,
/// the residual of 100 is split equally among the unspecified ones.
pub fn distribute_weights(explicit: &[Option<f64>]) -> Result<Vec<f64>> {
    let specified: f64 = explicit.iter().flatten().sum();
    if specified > 100.0 + f64::EPSILON {
        bail!("The specified weights sum to {specified}, exceeding 100");
    }

    let unspecified = explicit.iter().filter(|points| points.is_none()).count();
    let share = if unspecified == 0 { 0.0 } else { (100.0 - specified) / unspecified as f64 };

    Ok(explicit.iter().map(|points| points.unwrap_or(share)).collect())
}

/// Orders subtasks so every dependency precedes its dependents, breaking
/// ties by declaration index. Rejects unknown references and cycles.
pub fn topological_order(subtasks: &[Subtask]) -> Result<Vec<usize>> {
    let count = subtasks.len();
    let mut indegree = vec![0usize; count];
    let mut dependents: Vec<Vec<usize>> = vec![vec![]; count];

    for (index, subtask) in subtasks.iter().enumerate() {
        for &dependency in &subtask.dependencies {
            if dependency >= count {
                bail!("Subtask {index} depends on the nonexistent subtask {dependency}");
            }
            indegree[index] += 1;
            dependents[dependency].push(index);
        }
    }

    let mut order = Vec::with_capacity(count);
    let mut ready: Vec<usize> =
        (0..count).filter(|&index| indegree[index] == 0).rev().collect();

    while let Some(index) = ready.pop() {
        order.push(index);
        for &dependent in &dependents[index] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                // Keep `ready` sorted descending so the smallest index pops
                // first.
                let position = ready.binary_search_by(|x| dependent.cmp(x)).unwrap_or_else(|p| p);
                ready.insert(position, dependent);
            }
        }
    }

    if order.len() != count {
        bail!("The subtask dependency graph contains a cycle");
    }

    Ok(order)
}

/// Where a testcase run sits in the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseRef {
    Sample { index: usize },
    Subtask { subtask: usize, testcase: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct CaseGrade {
    pub status: TestcaseStatus,
    pub score: u32,
}

/// The scoring engine drives testcase execution through this seam; the
/// orchestrator supplies the sandbox-facing implementation, tests supply a
/// scripted one.
pub trait PlanDriver: Send + Sync {
    fn run_case<'a>(
        &'a self,
        case: CaseRef,
        limits: EffectiveLimits,
        weight: f64,
    ) -> BoxFuture<'a, Result<CaseGrade>>;

    fn skip_case(&self, case: CaseRef);
}

#[derive(Debug)]
pub struct PlanVerdict {
    pub score: u32,
    pub status: SubmissionStatus,
    pub subtask_scores: Vec<f64>,
}

/// Walks a judging plan: the optional sample phase, then every subtask in
/// topological order with its scoring mode, then the final aggregation.
#[instrument(skip_all)]
pub async fn execute_plan(
    plan: &JudgingPlan,
    problem_type: ProblemType,
    sample_count: usize,
    skip_samples: bool,
    driver: &dyn PlanDriver,
) -> Result<PlanVerdict> {
    let subtask_weights =
        distribute_weights(&plan.subtasks.iter().map(|s| s.points).collect::<Vec<_>>())?;
    let order = topological_order(&plan.subtasks)?;

    let mut statuses: Vec<Vec<Option<TestcaseStatus>>> =
        plan.subtasks.iter().map(|subtask| vec![None; subtask.testcases.len()]).collect();
    let mut sample_statuses: Vec<Option<TestcaseStatus>> = vec![None; sample_count];

    // Samples are diagnostic: any non-accepted sample skips every subtask.
    let mut samples_failed = false;
    let run_samples = plan.run_samples
        && sample_count > 0
        && !skip_samples
        && !matches!(problem_type, ProblemType::SubmitAnswer);
    if run_samples {
        let limits = EffectiveLimits {
            time_ms: plan.time_limit.unwrap_or_default(),
            memory_mib: plan.memory_limit.unwrap_or_default(),
        };

        for index in 0..sample_count {
            if samples_failed {
                driver.skip_case(CaseRef::Sample { index });
                continue;
            }

            let grade = driver.run_case(CaseRef::Sample { index }, limits, 0.0).await?;
            sample_statuses[index] = Some(grade.status);
            if !matches!(grade.status, TestcaseStatus::Accepted) {
                samples_failed = true;
            }
        }
    }

    let mut subtask_scores: Vec<Option<f64>> = vec![None; plan.subtasks.len()];

    for &index in &order {
        let subtask = &plan.subtasks[index];

        let dependency_failed = subtask
            .dependencies
            .iter()
            .any(|&dependency| subtask_scores[dependency].unwrap_or(0.0).round() == 0.0);
        if dependency_failed || samples_failed {
            for testcase in 0..subtask.testcases.len() {
                driver.skip_case(CaseRef::Subtask { subtask: index, testcase });
            }
            subtask_scores[index] = Some(0.0);
            continue;
        }

        let case_weights =
            distribute_weights(&subtask.testcases.iter().map(|t| t.points).collect::<Vec<_>>())?;

        let score = match subtask.scoring_type {
            ScoringType::Sum => {
                let grades = future::try_join_all(subtask.testcases.iter().enumerate().map(
                    |(testcase, case)| {
                        let limits = EffectiveLimits::resolve(plan, subtask, case);
                        let weight = case_weights[testcase];
                        async move {
                            let grade = driver
                                .run_case(
                                    CaseRef::Subtask { subtask: index, testcase },
                                    limits,
                                    weight,
                                )
                                .await?;
                            Ok::<_, anyhow::Error>((testcase, grade))
                        }
                    },
                ))
                .await?;

                let mut total = 0.0;
                for (testcase, grade) in grades {
                    statuses[index][testcase] = Some(grade.status);
                    total += grade.score as f64 * case_weights[testcase] / 100.0;
                }
                total
            }
            ScoringType::GroupMin | ScoringType::GroupMul => {
                let mut running = 100.0f64;
                for (testcase, case) in subtask.testcases.iter().enumerate() {
                    if running.round() == 0.0 {
                        driver.skip_case(CaseRef::Subtask { subtask: index, testcase });
                        continue;
                    }

                    let limits = EffectiveLimits::resolve(plan, subtask, case);
                    let grade = driver
                        .run_case(
                            CaseRef::Subtask { subtask: index, testcase },
                            limits,
                            case_weights[testcase],
                        )
                        .await?;
                    statuses[index][testcase] = Some(grade.status);

                    running = match subtask.scoring_type {
                        ScoringType::GroupMin => running.min(grade.score as f64),
                        _ => running * grade.score as f64 / 100.0,
                    };
                }
                running
            }
        };

        subtask_scores[index] = Some(score);
    }

    let subtask_scores: Vec<f64> =
        subtask_scores.into_iter().map(|score| score.unwrap_or(0.0)).collect();

    let total: f64 = subtask_scores
        .iter()
        .zip(&subtask_weights)
        .map(|(score, weight)| score * weight / 100.0)
        .sum();
    let score = (total.round() as i64).clamp(0, 100) as u32;

    let first_failure = sample_statuses
        .iter()
        .flatten()
        .chain(statuses.iter().flat_map(|subtask| subtask.iter().flatten()))
        .find(|status| !matches!(status, TestcaseStatus::Accepted));

    let status = match first_failure {
        Some(status) => SubmissionStatus::from(*status),
        None if score == 100 => SubmissionStatus::Accepted,
        None if plan.subtasks.iter().all(|subtask| subtask.testcases.is_empty()) => {
            SubmissionStatus::Accepted
        }
        None => bail!("Every testcase was accepted yet the total score is {score}"),
    };

    Ok(PlanVerdict { score, status, subtask_scores })
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::Mutex,
    };

    use futures_util::{future::BoxFuture, FutureExt};

    use super::*;
    use crate::entities::{JudgingPlan, ScoringType, Subtask, Testcase, TestcaseStatus};

    fn testcase() -> Testcase {
        Testcase {
            input_file: None,
            output_file: None,
            user_output_filename: None,
            time_limit: None,
            memory_limit: None,
            points: None,
        }
    }

    fn subtask(scoring_type: ScoringType, cases: usize, dependencies: Vec<usize>) -> Subtask {
        Subtask {
            time_limit: None,
            memory_limit: None,
            scoring_type,
            points: None,
            dependencies,
            testcases: (0..cases).map(|_| testcase()).collect(),
        }
    }

    fn plan(subtasks: Vec<Subtask>) -> JudgingPlan {
        JudgingPlan {
            time_limit: Some(1000),
            memory_limit: Some(256),
            run_samples: false,
            subtasks,
            checker: None,
            interactor: None,
            file_io: None,
            extra_source_files: HashMap::new(),
        }
    }

    /// A scripted driver: grades are looked up per case, everything else is
    /// accepted with 100.
    #[derive(Default)]
    struct ScriptedDriver {
        grades: HashMap<(usize, usize), CaseGrade>,
        sample_grades: HashMap<usize, CaseGrade>,
        executed: Mutex<Vec<CaseRef>>,
        skipped: Mutex<Vec<CaseRef>>,
    }

    impl PlanDriver for ScriptedDriver {
        fn run_case<'a>(
            &'a self,
            case: CaseRef,
            _limits: EffectiveLimits,
            _weight: f64,
        ) -> BoxFuture<'a, anyhow::Result<CaseGrade>> {
            async move {
                self.executed.lock().unwrap().push(case);
                let grade = match case {
                    CaseRef::Sample { index } => self.sample_grades.get(&index),
                    CaseRef::Subtask { subtask, testcase } => {
                        self.grades.get(&(subtask, testcase))
                    }
                };
                Ok(*grade
                    .unwrap_or(&CaseGrade { status: TestcaseStatus::Accepted, score: 100 }))
            }
            .boxed()
        }

        fn skip_case(&self, case: CaseRef) {
            self.skipped.lock().unwrap().push(case);
        }
    }

    #[test]
    fn test_distribute_weights_all_unspecified() {
        let weights = distribute_weights(&[None, None, None, None]).unwrap();
        assert_eq!(weights, vec![25.0; 4]);
    }

    #[test]
    fn test_distribute_weights_partial() {
        let weights = distribute_weights(&[Some(40.0), None, None]).unwrap();
        assert_eq!(weights, vec![40.0, 30.0, 30.0]);
    }

    #[test]
    fn test_distribute_weights_overflow() {
        assert!(distribute_weights(&[Some(80.0), Some(30.0)]).is_err());
    }

    #[test]
    fn test_topological_order_respects_dependencies() {
        let subtasks = vec![
            subtask(ScoringType::Sum, 1, vec![2]),
            subtask(ScoringType::Sum, 1, vec![]),
            subtask(ScoringType::Sum, 1, vec![1]),
        ];
        assert_eq!(topological_order(&subtasks).unwrap(), vec![1, 2, 0]);
    }

    #[test]
    fn test_topological_order_ties_by_index() {
        let subtasks = vec![
            subtask(ScoringType::Sum, 1, vec![]),
            subtask(ScoringType::Sum, 1, vec![]),
            subtask(ScoringType::Sum, 1, vec![]),
        ];
        assert_eq!(topological_order(&subtasks).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_topological_order_rejects_cycles() {
        let subtasks =
            vec![subtask(ScoringType::Sum, 1, vec![1]), subtask(ScoringType::Sum, 1, vec![0])];
        assert!(topological_order(&subtasks).is_err());
    }

    #[tokio::test]
    async fn test_accepted_plan() {
        let plan = plan(vec![subtask(ScoringType::Sum, 2, vec![])]);
        let driver = ScriptedDriver::default();

        let verdict =
            execute_plan(&plan, ProblemType::Batch, 0, false, &driver).await.unwrap();
        assert_eq!(verdict.score, 100);
        assert_eq!(verdict.status, SubmissionStatus::Accepted);
    }

    #[tokio::test]
    async fn test_group_min_short_circuits() {
        let plan = plan(vec![subtask(ScoringType::GroupMin, 2, vec![])]);
        let mut driver = ScriptedDriver::default();
        driver.grades.insert(
            (0, 0),
            CaseGrade { status: TestcaseStatus::TimeLimitExceeded, score: 0 },
        );

        let verdict =
            execute_plan(&plan, ProblemType::Batch, 0, false, &driver).await.unwrap();
        assert_eq!(verdict.score, 0);
        assert_eq!(verdict.status, SubmissionStatus::TimeLimitExceeded);
        assert_eq!(
            *driver.skipped.lock().unwrap(),
            vec![CaseRef::Subtask { subtask: 0, testcase: 1 }]
        );
    }

    #[tokio::test]
    async fn test_group_mul_aggregates() {
        let plan = plan(vec![subtask(ScoringType::GroupMul, 2, vec![])]);
        let mut driver = ScriptedDriver::default();
        driver
            .grades
            .insert((0, 0), CaseGrade { status: TestcaseStatus::PartiallyCorrect, score: 50 });
        driver
            .grades
            .insert((0, 1), CaseGrade { status: TestcaseStatus::PartiallyCorrect, score: 50 });

        let verdict =
            execute_plan(&plan, ProblemType::Batch, 0, false, &driver).await.unwrap();
        assert_eq!(verdict.score, 25);
        assert_eq!(verdict.status, SubmissionStatus::PartiallyCorrect);
    }

    #[tokio::test]
    async fn test_dependency_skip() {
        let plan = plan(vec![
            subtask(ScoringType::Sum, 1, vec![]),
            subtask(ScoringType::Sum, 2, vec![0]),
        ]);
        let mut driver = ScriptedDriver::default();
        driver
            .grades
            .insert((0, 0), CaseGrade { status: TestcaseStatus::WrongAnswer, score: 0 });

        let verdict =
            execute_plan(&plan, ProblemType::Batch, 0, false, &driver).await.unwrap();
        assert_eq!(verdict.score, 0);
        assert_eq!(verdict.status, SubmissionStatus::WrongAnswer);
        assert_eq!(driver.skipped.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sample_failure_skips_subtasks() {
        let mut judging_plan = plan(vec![subtask(ScoringType::Sum, 2, vec![])]);
        judging_plan.run_samples = true;
        let mut driver = ScriptedDriver::default();
        driver
            .sample_grades
            .insert(0, CaseGrade { status: TestcaseStatus::WrongAnswer, score: 0 });

        let verdict =
            execute_plan(&judging_plan, ProblemType::Batch, 2, false, &driver).await.unwrap();
        assert_eq!(verdict.score, 0);
        assert_eq!(verdict.status, SubmissionStatus::WrongAnswer);
        // The second sample and both testcases are skipped.
        assert_eq!(driver.skipped.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_skip_samples_flag() {
        let mut judging_plan = plan(vec![subtask(ScoringType::Sum, 1, vec![])]);
        judging_plan.run_samples = true;
        let mut driver = ScriptedDriver::default();
        driver
            .sample_grades
            .insert(0, CaseGrade { status: TestcaseStatus::WrongAnswer, score: 0 });

        let verdict =
            execute_plan(&judging_plan, ProblemType::Batch, 1, true, &driver).await.unwrap();
        assert_eq!(verdict.score, 100);
        assert_eq!(verdict.status, SubmissionStatus::Accepted);
    }

    #[tokio::test]
    async fn test_explicit_subtask_weights() {
        let mut first = subtask(ScoringType::Sum, 1, vec![]);
        first.points = Some(30.0);
        let mut second = subtask(ScoringType::Sum, 1, vec![]);
        second.points = Some(70.0);
        let plan = plan(vec![first, second]);

        let mut driver = ScriptedDriver::default();
        driver
            .grades
            .insert((1, 0), CaseGrade { status: TestcaseStatus::WrongAnswer, score: 0 });

        let verdict =
            execute_plan(&plan, ProblemType::Batch, 0, false, &driver).await.unwrap();
        assert_eq!(verdict.score, 30);
        assert_eq!(verdict.status, SubmissionStatus::WrongAnswer);
    }
}
