use std::path::PathBuf;

use anyhow::{anyhow, Result};

pub fn usage() -> &'static str {
    "Usage: character_studio <command> [options]

Commands:
  characters
  character-add --name <n> --hair-color <c> --eye-color <c> --skin-color <c>
                [--hair-length <l>] [--hair-texture <t>] [--avatar <path>] [--id <id>]
  character-delete --id <id>
  generate --character <id> --image <path> [--image <path> ...]
  jobs
  job-delete --id <id>
  jobs-clear
  export --dir <path>"
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacterArgs {
    pub id: Option<String>,
    pub name: String,
    pub hair_color: String,
    pub eye_color: String,
    pub skin_color: String,
    pub hair_length: Option<String>,
    pub hair_texture: Option<String>,
    pub avatar: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Characters,
    CharacterAdd(CharacterArgs),
    CharacterDelete { id: String },
    Generate {
        character_id: String,
        images: Vec<PathBuf>,
    },
    Jobs,
    JobDelete { id: String },
    JobsClear,
    Export { dir: PathBuf },
}

impl Command {
    /// Commands that call the model and therefore need an API key.
    pub fn needs_credential(&self) -> bool {
        matches!(self, Command::Generate { .. })
    }
}

/// `args[0]` is the program name, as returned by `std::env::args`.
pub fn parse_args(args: &[String]) -> Result<Command> {
    let Some(name) = args.get(1) else {
        return Ok(Command::Help);
    };
    let options = Options::parse(name, &args[2..])?;

    let command = match name.as_str() {
        "help" | "--help" | "-h" => Command::Help,
        "characters" => Command::Characters,
        "character-add" => Command::CharacterAdd(CharacterArgs {
            id: options.optional("--id"),
            name: options.required("--name")?,
            hair_color: options.required("--hair-color")?,
            eye_color: options.required("--eye-color")?,
            skin_color: options.required("--skin-color")?,
            hair_length: options.optional("--hair-length"),
            hair_texture: options.optional("--hair-texture"),
            avatar: options.optional("--avatar").map(PathBuf::from),
        }),
        "character-delete" => Command::CharacterDelete {
            id: options.required("--id")?,
        },
        "generate" => {
            let images: Vec<PathBuf> = options.all("--image").map(PathBuf::from).collect();
            if images.is_empty() {
                return Err(anyhow!("--image is required"));
            }
            Command::Generate {
                character_id: options.required("--character")?,
                images,
            }
        }
        "jobs" => Command::Jobs,
        "job-delete" => Command::JobDelete {
            id: options.required("--id")?,
        },
        "jobs-clear" => Command::JobsClear,
        "export" => Command::Export {
            dir: PathBuf::from(options.required("--dir")?),
        },
        other => return Err(anyhow!("Unknown command: {other}\n{}", usage())),
    };

    options.reject_unused(&command)?;
    Ok(command)
}

struct Options {
    command: String,
    pairs: Vec<(String, String)>,
}

impl Options {
    fn parse(command: &str, args: &[String]) -> Result<Self> {
        let mut pairs = Vec::new();
        let mut index = 0;
        while index < args.len() {
            let flag = args[index].as_str();
            if flag == "--help" || flag == "-h" {
                return Err(anyhow!(usage()));
            }
            if !flag.starts_with("--") {
                return Err(anyhow!(
                    "Unexpected argument for {command}: {flag}\n{}",
                    usage()
                ));
            }
            index += 1;
            let value = args
                .get(index)
                .filter(|value| !value.starts_with("--"))
                .ok_or_else(|| anyhow!("Missing value for {flag}"))?;
            pairs.push((flag.to_string(), value.clone()));
            index += 1;
        }
        Ok(Options {
            command: command.to_string(),
            pairs,
        })
    }

    fn all<'a>(&'a self, flag: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.pairs
            .iter()
            .filter(move |(name, _)| name == flag)
            .map(|(_, value)| value.as_str())
    }

    fn optional(&self, flag: &str) -> Option<String> {
        self.all(flag)
            .last()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    fn required(&self, flag: &str) -> Result<String> {
        self.optional(flag)
            .ok_or_else(|| anyhow!("{flag} is required"))
    }

    fn reject_unused(&self, command: &Command) -> Result<()> {
        let known: &[&str] = match command {
            Command::CharacterAdd(_) => &[
                "--id",
                "--name",
                "--hair-color",
                "--eye-color",
                "--skin-color",
                "--hair-length",
                "--hair-texture",
                "--avatar",
            ],
            Command::CharacterDelete { .. } | Command::JobDelete { .. } => &["--id"],
            Command::Generate { .. } => &["--character", "--image"],
            Command::Export { .. } => &["--dir"],
            _ => &[],
        };
        match self.pairs.iter().find(|(name, _)| !known.contains(&name.as_str())) {
            Some((name, _)) => Err(anyhow!(
                "Unknown {} argument: {name}\n{}",
                self.command,
                usage()
            )),
            None => Ok(()),
        }
    }
}
