//! Parse input configuration file

use std::error::Error;
use std::fmt;
use std::path::Path;

use meval::Context;
use yaml_rust::{yaml::Yaml, YamlLoader};

pub enum InputError {
    InvalidInputFile(&'static str),
    CouldNotParse(String, String),
    MissingField(String, String),
}

impl fmt::Debug for InputError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use InputError::*;
        let help_msg = "Usage: mpirun -n np ./domdec input-file";
        match self {
            InvalidInputFile(s) => write!(f, "invalid input file: {}\n{}", s, help_msg),
            CouldNotParse(token, field) => write!(
                f,
                "unable to parse '{}' = '{}' in configuration file",
                token, field
            ),
            MissingField(section, field) => write!(
                f,
                "unable to find '{}' in section '{}' with correct type in configuration file",
                field, section
            ),
        }
    }
}

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Error for InputError {}

/// Represents the input configuration, can be queried
/// for desired parameters
pub struct Configuration<'a> {
    input: Yaml,
    ctx: Context<'a>,
}

impl<'a> Configuration<'a> {
    pub fn from_file(path: &Path) -> Result<Configuration<'a>, InputError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|_e| InputError::InvalidInputFile("unable to read file"))?;
        Configuration::from_string(&contents)
    }

    pub fn from_string(contents: &str) -> Result<Configuration<'a>, InputError> {
        let input = YamlLoader::load_from_str(contents)
            .map_err(|_e| InputError::InvalidInputFile("yaml trouble"))?;
        let input = input
            .first()
            .ok_or(InputError::InvalidInputFile("yaml trouble"))?;
        Ok(Configuration {
            input: input.clone(),
            ctx: Context::new(),
        })
    }

    pub fn with_context(&mut self, section: &str) -> &mut Self {
        self.ctx
            .var("micro", 1.0e-6)
            .var("milli", 1.0e-3)
            .var("kilo", 1.0e3)
            .var("mega", 1.0e6)
            .var("giga", 1.0e9)
            .var("KiB", 1024.0)
            .var("MiB", 1024.0 * 1024.0)
            .var("GiB", 1024.0 * 1024.0 * 1024.0);

        // Read in from the given block, usually 'constants'
        let tmp = self.ctx.clone(); // a constant cannot depend on other constants yet...

        if let Some(hash) = self.input[section].as_hash() {
            for (a, b) in hash {
                match (a, b) {
                    (Yaml::String(s), Yaml::Real(v)) => {
                        if let Ok(num) = v.parse::<f64>() {
                            self.ctx.var(s, num);
                        }
                    }
                    (Yaml::String(s), Yaml::Integer(v)) => {
                        self.ctx.var(s, *v as f64);
                    }
                    (Yaml::String(s), Yaml::String(v)) => {
                        if let Ok(expr) = v.parse::<meval::Expr>() {
                            if let Ok(num) = expr.eval_with_context(&tmp) {
                                self.ctx.var(s, num);
                            }
                        }
                    }
                    _ => (),
                }
            }
        }

        self
    }

    pub fn real(&self, section: &str, field: &str) -> Result<f64, InputError> {
        let name = field.to_owned();
        match &self.input[section][field] {
            Yaml::Real(s) => s
                .parse::<f64>()
                .map_err(|_| InputError::CouldNotParse(name.clone(), s.clone())),
            Yaml::Integer(i) => Ok(*i as f64),
            Yaml::String(s) => {
                let expr = s
                    .parse::<meval::Expr>()
                    .map_err(|_| InputError::CouldNotParse(name.clone(), s.clone()))?;
                expr.eval_with_context(&self.ctx)
                    .map_err(|_| InputError::CouldNotParse(name.clone(), s.clone()))
            }
            _ => Err(InputError::MissingField(section.to_owned(), name)),
        }
    }

    pub fn integer(&self, section: &str, field: &str) -> Result<i64, InputError> {
        match &self.input[section][field] {
            Yaml::Integer(i) => Ok(*i),
            Yaml::String(_) | Yaml::Real(_) => self.real(section, field).map(|v| v as i64),
            _ => Err(InputError::MissingField(
                section.to_owned(),
                field.to_owned(),
            )),
        }
    }

    pub fn bool(&self, section: &str, field: &str) -> Result<bool, InputError> {
        match &self.input[section][field] {
            Yaml::Boolean(b) => Ok(*b),
            _ => Err(InputError::MissingField(
                section.to_owned(),
                field.to_owned(),
            )),
        }
    }

    pub fn string(&self, section: &str, field: &str) -> Result<String, InputError> {
        match &self.input[section][field] {
            Yaml::String(s) => Ok(s.clone()),
            _ => Err(InputError::MissingField(
                section.to_owned(),
                field.to_owned(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expressions_use_the_constants_section() {
        let mut config = Configuration::from_string(
            "constants:\n  npart: 1000\ndomain:\n  box_size: 2.0\n  free_bytes: 64 * MiB\nic:\n  npart_dm: npart\n",
        )
        .unwrap();
        config.with_context("constants");
        assert_eq!(config.real("domain", "box_size").unwrap(), 2.0);
        assert_eq!(
            config.real("domain", "free_bytes").unwrap(),
            (64 * 1024 * 1024) as f64
        );
        assert_eq!(config.integer("ic", "npart_dm").unwrap(), 1000);
    }

    #[test]
    fn missing_fields_are_reported_with_their_section() {
        let config = Configuration::from_string("domain:\n  box_size: 1.0\n").unwrap();
        let err = config.real("domain", "absent").unwrap_err();
        let msg = format!("{}", err);
        assert!(msg.contains("absent") && msg.contains("domain"));
    }
}
