use std::{
    collections::BTreeMap,
    ffi::{OsStr, OsString},
};

/// Program, arguments and environment of a tracer subprocess
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    program: OsString,
    argv: Vec<OsString>,
    envs: BTreeMap<OsString, OsString>,
}

impl CommandBuilder {
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            program: program.as_ref().to_owned(),
            argv: Vec::new(),
            envs: BTreeMap::new(),
        }
    }

    pub fn build(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.argv);
        command.envs(&self.envs);
        command
    }

    pub fn env<K, V>(&mut self, key: K, value: V) -> &mut Self
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.envs
            .insert(key.as_ref().to_owned(), value.as_ref().to_owned());
        self
    }

    /// Names of the variables set with [`CommandBuilder::env`]
    pub fn env_keys(&self) -> impl Iterator<Item = &OsStr> {
        self.envs.keys().map(OsString::as_os_str)
    }

    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.argv.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.arg(arg.as_ref());
        }
        self
    }

    /// Run the current command through `wrapper`, e.g. `sudo`
    pub fn wrap<S, I, T>(&mut self, wrapper: S, wrapper_args: I) -> &mut Self
    where
        S: AsRef<OsStr>,
        I: IntoIterator<Item = T>,
        T: AsRef<OsStr>,
    {
        let mut new_argv: Vec<OsString> = wrapper_args
            .into_iter()
            .map(|arg| arg.as_ref().to_owned())
            .collect();
        new_argv.push(self.program.clone());
        new_argv.append(&mut self.argv);

        self.program = wrapper.as_ref().to_owned();
        self.argv = new_argv;
        self
    }

    /// Returns the command line as a string for logs and error messages, variables first
    pub fn as_command_line(&self) -> String {
        let mut parts: Vec<String> = vec![self.program.to_string_lossy().into_owned()];
        parts.extend(
            self.argv
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        let command_line = shell_words::join(parts);

        let mut line: Vec<String> = self
            .envs
            .iter()
            .map(|(key, value)| {
                format!(
                    "{}={}",
                    key.to_string_lossy(),
                    shell_words::quote(&value.to_string_lossy())
                )
            })
            .collect();
        line.push(command_line);
        line.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_with_args() {
        let mut builder = CommandBuilder::new("bpftrace");
        builder.arg("-e").wrap("sudo", ["--non-interactive"]);
        assert_eq!(
            builder.as_command_line(),
            "sudo --non-interactive bpftrace -e"
        );
    }

    #[test]
    fn test_multiple_wraps() {
        let mut builder = CommandBuilder::new("bpftrace");
        builder
            .args(["-e", "BEGIN {}"])
            .wrap("taskset", ["-c", "0"])
            .wrap("sudo", ["-n"]);
        assert_eq!(
            builder.as_command_line(),
            "sudo -n taskset -c 0 bpftrace -e 'BEGIN {}'"
        );
    }

    #[test]
    fn test_envs_are_set_on_the_process() {
        let mut builder = CommandBuilder::new("bpftrace");
        builder.arg("-l").env("BPFTRACE_STRLEN", "64");
        assert_eq!(builder.as_command_line(), "BPFTRACE_STRLEN=64 bpftrace -l");
        assert_eq!(builder.env_keys().collect::<Vec<_>>(), ["BPFTRACE_STRLEN"]);

        let cmd = builder.build();
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "bpftrace");
        let envs: Vec<_> = std_cmd.get_envs().collect();
        assert_eq!(
            envs,
            [(OsStr::new("BPFTRACE_STRLEN"), Some(OsStr::new("64")))]
        );
    }

    #[test]
    fn test_wrap_and_build() {
        let mut builder = CommandBuilder::new("ls");
        builder.arg("-la").wrap("sudo", ["-n"]);

        let cmd = builder.build();
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "sudo");

        let args: Vec<_> = std_cmd.get_args().collect();
        assert_eq!(args, vec!["-n", "ls", "-la"]);
    }
}
