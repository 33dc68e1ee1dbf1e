//! Per job customization of submission templates.
//!
//! Strategies are registered statically in [`Strategy`] and selected by name on the command line.

use super::template::{EnvironmentVariable, JobTemplate};
use crate::error::UserError;
use clap::ValueEnum;
use std::collections::BTreeMap;

pub trait TemplateStrategy {
    /// `iteration` counts from 1 up to the number of jobs being submitted.
    fn apply(&self, template: JobTemplate, iteration: u32) -> JobTemplate;
}

/// Every registered strategy. The kebab-case variant name is the name used on the command line.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum Strategy {
    /// Replace the command with `echo "hello from iteration N"`
    EchoIteration,
    /// Set the `JOB_ITERATION` environment variable
    IterationEnv,
    /// Set the `iteration` parameter
    IterationParameter,
}

impl Strategy {
    pub fn from_name(name: &str) -> Result<Strategy, UserError> {
        Strategy::from_str(name, false).map_err(|_| {
            let known: Vec<String> = Strategy::value_variants()
                .iter()
                .filter_map(|x| x.to_possible_value())
                .map(|x| x.get_name().to_owned())
                .collect();
            UserError::Usage(format!(
                "Unknown strategy {name:?}, expected one of: {}",
                known.join(", ")
            ))
        })
    }
}

impl TemplateStrategy for Strategy {
    fn apply(&self, template: JobTemplate, iteration: u32) -> JobTemplate {
        match self {
            Strategy::EchoIteration => EchoIteration.apply(template, iteration),
            Strategy::IterationEnv => IterationEnv.apply(template, iteration),
            Strategy::IterationParameter => IterationParameter.apply(template, iteration),
        }
    }
}

pub struct EchoIteration;

impl TemplateStrategy for EchoIteration {
    fn apply(&self, mut template: JobTemplate, iteration: u32) -> JobTemplate {
        template.container_overrides.command = Some(vec![
            "echo".to_owned(),
            format!("hello from iteration {iteration}"),
        ]);
        template
    }
}

pub struct IterationEnv;

impl TemplateStrategy for IterationEnv {
    fn apply(&self, mut template: JobTemplate, iteration: u32) -> JobTemplate {
        const NAME: &str = "JOB_ITERATION";
        let environment = template
            .container_overrides
            .environment
            .get_or_insert_with(Vec::new);
        environment.retain(|x| x.name != NAME);
        environment.push(EnvironmentVariable {
            name: NAME.to_owned(),
            value: iteration.to_string(),
        });
        template
    }
}

pub struct IterationParameter;

impl TemplateStrategy for IterationParameter {
    fn apply(&self, mut template: JobTemplate, iteration: u32) -> JobTemplate {
        template
            .parameters
            .get_or_insert_with(BTreeMap::new)
            .insert("iteration".to_owned(), iteration.to_string());
        template
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::batch::template::{build_template, JobOptions};
    use pretty_assertions::assert_eq;

    fn template() -> JobTemplate {
        build_template(&JobOptions {
            name: "x".to_owned(),
            queue: "small".to_owned(),
            job_definition: "hello:2".to_owned(),
            environment: Some(r#"[{"name": "JOB_ITERATION", "value": "old"}, {"name": "A", "value": "b"}]"#.to_owned()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn lookup_by_name() {
        assert_eq!(
            Strategy::from_name("echo-iteration").unwrap(),
            Strategy::EchoIteration
        );
        assert_eq!(
            Strategy::from_name("iteration-parameter").unwrap(),
            Strategy::IterationParameter
        );
        assert_eq!(
            Strategy::from_name("myscript.myfunc").unwrap_err().to_string(),
            "Unknown strategy \"myscript.myfunc\", expected one of: echo-iteration, iteration-env, iteration-parameter"
        );
    }

    #[test]
    fn echo_iteration() {
        let template = Strategy::EchoIteration.apply(template(), 7);
        assert_eq!(
            template.container_overrides.command,
            Some(vec!["echo".to_owned(), "hello from iteration 7".to_owned()])
        );
    }

    #[test]
    fn iteration_env_replaces_existing() {
        let template = Strategy::IterationEnv.apply(template(), 2);
        assert_eq!(
            template.container_overrides.environment,
            Some(vec![
                EnvironmentVariable {
                    name: "A".to_owned(),
                    value: "b".to_owned()
                },
                EnvironmentVariable {
                    name: "JOB_ITERATION".to_owned(),
                    value: "2".to_owned()
                },
            ])
        );
    }

    #[test]
    fn iteration_parameter() {
        let template = Strategy::IterationParameter.apply(template(), 3);
        assert_eq!(
            template.parameters,
            Some(BTreeMap::from([("iteration".to_owned(), "3".to_owned())]))
        );
    }
}
