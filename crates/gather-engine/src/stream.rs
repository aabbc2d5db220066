//! Remote half of the Transfer Channel.
//!
//! The collector runs in the background under a POSIX `sh` wrapper that scans
//! the source directory and frames its contents onto stdout (see
//! `gather_core::wire`). Files are sent once their size is unchanged across two
//! scans. After the collector exits a final scan re-sends every file whose
//! checksum differs from the copy sent, withdraws sent paths that are gone with
//! `R`, and ends with `X`.
//! A blocked stdout stalls the wrapper, which is the channel's flow control.

/// `$0` of the wrapper shell, visible in remote process listings.
pub const WRAPPER_NAME: &str = "must-gather";

pub const STREAM_SCRIPT: &str = r#"set -u
SRC="$1"; SETTLE="$2"; shift 2
mkdir -p "$SRC" || exit 125
cd "$SRC" || exit 125
export GATHER_SOURCE_DIR="$SRC"
STATE="$(mktemp -d 2>/dev/null || echo "/tmp/must-gather-stream.$$")"
mkdir -p "$STATE"
: > "$STATE/sent"
: > "$STATE/sums"
: > "$STATE/prev"

( "$@" >&2 </dev/null; echo $? > "$STATE/exit.tmp"; mv "$STATE/exit.tmp" "$STATE/exit" ) &

scan() {
  FINAL="$1"
  find . -mindepth 1 -type d 2>/dev/null | sed 's|^\./||' | sort > "$STATE/dirs"
  while IFS= read -r d; do
    if ! grep -Fxq -- "D $d" "$STATE/sent"; then
      printf 'D %s\n' "$d"
      printf 'D %s\n' "$d" >> "$STATE/sent"
    fi
  done < "$STATE/dirs"

  : > "$STATE/cur"
  find . -type f 2>/dev/null | sed 's|^\./||' | sort > "$STATE/files"
  while IFS= read -r f; do
    [ -f "$f" ] || continue
    size=$(wc -c < "$f" | tr -d ' ')
    printf '%s %s\n' "$size" "$f" >> "$STATE/cur"
    if [ "$FINAL" = 0 ]; then
      grep -Fxq -- "F $size $f" "$STATE/sent" && continue
      grep -Fxq -- "$size $f" "$STATE/prev" || continue
    else
      sum=$(cksum < "$f" 2>/dev/null) || continue
      grep -Fxq -- "$sum $f" "$STATE/sums" && continue
    fi
    cp "$f" "$STATE/snap" 2>/dev/null || continue
    n=$(wc -c < "$STATE/snap" | tr -d ' ')
    printf 'F %s %s\n' "$n" "$f"
    cat "$STATE/snap"
    printf 'F %s %s\n' "$n" "$f" >> "$STATE/sent"
    sum=$(cksum < "$STATE/snap")
    if grep -Fq -- " $f" "$STATE/sums"; then
      P="$f" awk '{ p = $0; sub(/^[^ ]* [^ ]* /, "", p); if (p != ENVIRON["P"]) print }' \
        "$STATE/sums" > "$STATE/sums.tmp" && mv "$STATE/sums.tmp" "$STATE/sums"
    fi
    printf '%s %s\n' "$sum" "$f" >> "$STATE/sums"
  done < "$STATE/files"
  mv "$STATE/cur" "$STATE/prev"

  [ "$FINAL" = 1 ] || return 0
  sed -n 's/^F [0-9]* //p' "$STATE/sent" | sort -u > "$STATE/gone"
  while IFS= read -r f; do
    [ -e "$f" ] || printf 'R %s\n' "$f"
  done < "$STATE/gone"
  sed -n 's/^D //p' "$STATE/sent" | sort -r > "$STATE/gone"
  while IFS= read -r d; do
    [ -e "$d" ] || printf 'R %s\n' "$d"
  done < "$STATE/gone"
}

while [ ! -f "$STATE/exit" ]; do
  scan 0
  [ -f "$STATE/exit" ] || sleep "$SETTLE"
done
wait
CODE=$(cat "$STATE/exit")
scan 1
rm -rf "$STATE"
printf 'X %s\n' "$CODE"
"#;

/// Arguments after the shell binary: `-c <script> <name> <source> <settle> <cmd...>`.
pub fn wrapper_args(source_dir: &str, settle_secs: u64, command: &[String]) -> Vec<String> {
    let mut args = Vec::with_capacity(5 + command.len());
    args.push("-c".to_string());
    args.push(STREAM_SCRIPT.to_string());
    args.push(WRAPPER_NAME.to_string());
    args.push(source_dir.to_string());
    args.push(settle_secs.max(1).to_string());
    args.extend(command.iter().cloned());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapper_args_put_command_last() {
        let cmd = vec!["/bin/bash".to_string(), "-c".into(), "ls -l > /artifacts/ls.log".into()];
        let args = wrapper_args("/artifacts", 0, &cmd);
        assert_eq!(args[0], "-c");
        assert_eq!(args[2], WRAPPER_NAME);
        assert_eq!(args[3], "/artifacts");
        assert_eq!(args[4], "1");
        assert_eq!(&args[5..], &cmd[..]);
    }

    #[test]
    fn final_scan_compares_checksums_and_withdraws() {
        assert!(STREAM_SCRIPT.contains(r#"sum=$(cksum < "$f" 2>/dev/null)"#));
        assert!(STREAM_SCRIPT.contains(r#"printf 'R %s\n' "$f""#));
        let withdraw = STREAM_SCRIPT.find("printf 'R").unwrap();
        let exit = STREAM_SCRIPT.find("printf 'X").unwrap();
        assert!(withdraw < exit);
    }

    #[test]
    fn script_ends_with_exit_record() {
        assert!(STREAM_SCRIPT.trim_end().ends_with(r#"printf 'X %s\n' "$CODE""#));
    }
}
