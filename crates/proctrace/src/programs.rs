//! bpftrace programs, one per [`TraceKind`](crate::TraceKind).
//!
//! Every program prints one event per line, pid first, so that the parsers in
//! [`events`](crate::events) can split on the first spaces.

/// Default value of `BPFTRACE_STRLEN`, paths longer than this are cut by the tracer
pub const DEFAULT_STRLEN: usize = 200;

pub const EXEC_TRACE: &str = r#"
tracepoint:syscalls:sys_enter_exec*
{
    printf("%d %d %s\n", pid, curtask->real_parent->tgid, str(args->argv[0]));
}
"#;

pub const OPEN_TRACE: &str = r#"
tracepoint:syscalls:sys_enter_open,
tracepoint:syscalls:sys_enter_openat
{
    @filename[tid] = args->filename;
}

tracepoint:syscalls:sys_exit_open,
tracepoint:syscalls:sys_exit_openat
/@filename[tid]/
{
    $ret = args->ret;
    $fd = $ret > 0 ? $ret : -1;

    printf("%d %d %s\t\n", pid, $fd, str(@filename[tid]));
    delete(@filename[tid]);
}

END
{
    clear(@filename);
}
"#;

pub const CHDIR_TRACE: &str = r#"
tracepoint:syscalls:sys_enter_chdir*
{
    printf("%d %s\n", pid, str(args->filename));
}
"#;
