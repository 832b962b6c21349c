//! The coordinator: entry point for clients and owner of the local `.c` shard.
//!
//! A client connection is a sequence of commands processed strictly in order. Files of the
//! other shards are forwarded to, fetched from, or deleted on the responsible storage node.
//! Failures of a single file are reported in the reply and never end the connection. Only a
//! broken client connection, or a relayed stream that breaks after its size header was sent,
//! terminates the loop.

use crate::dispatcher::ConnectionHandler;
use crate::listing;
use crate::sink::DrainOnError;
use shardfs::archive::{Archiver, build_archive};
use shardfs::client::NodeClient;
use shardfs::command::{Command, upload_name};
use shardfs::error::{ShardError, ShardResult};
use shardfs::path::LogicalPath;
use shardfs::placement::{ShardId, locate, shard_for_extension};
use shardfs::protocol::{FrameReader, SizeHeader, copy_exact, write_reply, write_size};
use shardfs::report::{DeleteReply, RemoveOutcome, RemoveReport, StoreReply, UploadReport};
use shardfs::storage::DeleteOutcome;
use shardfs::storage::filesystem::FilesystemStorage;
use shardfs::util::close::Close;
use std::io;
use std::io::{BufWriter, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct Coordinator {
    storage: FilesystemStorage,
    nodes: Vec<NodeClient>,
    archiver: Arc<dyn Archiver>,
}

impl Coordinator {
    pub fn new(
        storage: FilesystemStorage,
        nodes: Vec<NodeClient>,
        archiver: Arc<dyn Archiver>,
    ) -> Self {
        Self {
            storage,
            nodes,
            archiver,
        }
    }

    fn node(&self, shard: ShardId) -> Option<&NodeClient> {
        self.nodes.iter().find(|node| node.shard() == shard)
    }

    fn serve<R: Read, W: Write>(
        &self,
        reader: &mut FrameReader<R>,
        writer: &mut W,
        peer: SocketAddr,
    ) -> ShardResult<()> {
        while let Some(line) = reader.read_command()? {
            if line.trim().is_empty() {
                continue;
            }
            match Command::parse(&line) {
                Ok(command) => {
                    info!(%peer, %command, "received command");
                    self.execute(command, reader, writer)?;
                }
                Err(err) => {
                    warn!(%peer, command = line, "rejected command: {err}");
                    write_reply(writer, &err.to_string())?;
                }
            }
        }
        debug!(%peer, "client disconnected");
        Ok(())
    }

    fn execute<R: Read, W: Write>(
        &self,
        command: Command,
        reader: &mut FrameReader<R>,
        writer: &mut W,
    ) -> ShardResult<()> {
        match command {
            Command::Upload { files, dest } => {
                let report = self.upload(&files, &dest, reader)?;
                write_reply(writer, &report.to_string())?;
            }
            Command::Download { paths } => {
                for path in &paths {
                    self.download(path, writer)?;
                }
            }
            Command::DownloadArchive { extension } => self.download_archive(&extension, writer)?,
            Command::Remove { paths } => {
                let mut report = RemoveReport::new();
                for path in &paths {
                    report.push(path, self.remove(path));
                }
                write_reply(writer, &report.to_string())?;
            }
            Command::List { path } => {
                let listing = listing::aggregate(&self.storage, &self.nodes, &path);
                write_reply(writer, &listing.to_string())?;
            }
        }
        Ok(())
    }

    /// Receives the payloads following an `uploadf` command and distributes them.
    ///
    /// Every payload is consumed from the connection, also those of rejected files.
    fn upload<R: Read>(
        &self,
        files: &[String],
        dest: &LogicalPath,
        reader: &mut FrameReader<R>,
    ) -> ShardResult<UploadReport> {
        let mut report = UploadReport::new();
        for file in files {
            let file_name = upload_name(file);
            let size = match reader.read_size()? {
                SizeHeader::Found(size) => size,
                SizeHeader::NotFound => {
                    warn!(file = file_name, "client did not send file");
                    report.push_failed(file_name, "file not sent by client");
                    continue;
                }
            };
            let Some(shard) = locate(file_name) else {
                warn!(file = file_name, "rejected upload of unsupported file type");
                reader.copy_exact(size, &mut io::sink())?;
                report.push_failed(file_name, "unsupported file type");
                continue;
            };
            match self.receive(dest, file_name, size, reader) {
                Ok(path) => match self.place(&path, dest, file_name, size, shard) {
                    Ok(()) => report.push_stored(file_name, shard),
                    Err(reason) => report.push_failed(file_name, reason),
                },
                Err(err) if err.is_fatal_for_connection() => return Err(err),
                Err(err) => {
                    error!(file = file_name, %dest, "failed to store upload: {err}");
                    report.push_failed(file_name, err);
                }
            }
        }
        Ok(report)
    }

    /// Stages an uploaded payload in the local shard.
    fn receive<R: Read>(
        &self,
        dest: &LogicalPath,
        file_name: &str,
        size: u64,
        reader: &mut FrameReader<R>,
    ) -> ShardResult<LogicalPath> {
        let staged = dest
            .join(file_name)
            .and_then(|path| Ok((path, self.storage.put(dest, file_name)?)));
        let (path, file) = match staged {
            Ok(staged) => staged,
            Err(err) => {
                reader.copy_exact(size, &mut io::sink())?;
                return Err(err);
            }
        };
        let mut sink = DrainOnError::new(file);
        reader.copy_exact(size, &mut sink)?;
        sink.into_result()?.close()?;
        info!(%path, size, "received file");
        Ok(path)
    }

    /// Moves a received file to its shard. The local copy is only removed after the storage
    /// node confirmed the file.
    fn place(
        &self,
        path: &LogicalPath,
        dest: &LogicalPath,
        file_name: &str,
        size: u64,
        shard: ShardId,
    ) -> Result<(), String> {
        if shard.is_local() {
            return Ok(());
        }
        let Some(node) = self.node(shard) else {
            return Err(format!("no storage node for {shard}"));
        };
        let forwarded = self
            .storage
            .open(path)
            .and_then(|(mut file, _)| node.upload(dest, file_name, size, &mut file));
        match forwarded {
            Ok(StoreReply::Stored) => {
                info!(%path, %shard, "forwarded file");
                if let Err(err) = self.storage.delete(path) {
                    warn!(%path, "failed to remove forwarded file: {err}");
                }
                Ok(())
            }
            Ok(StoreReply::Rejected(reason)) => {
                warn!(%path, %shard, "storage node rejected file: {reason}");
                Err(format!("rejected by {shard}: {reason}"))
            }
            Err(err) => {
                warn!(%path, %shard, "failed to forward file: {err}");
                Err(format!("failed to forward to {shard}: {err}"))
            }
        }
    }

    fn download<W: Write>(&self, path: &LogicalPath, writer: &mut W) -> ShardResult<()> {
        match path.file_name().and_then(locate) {
            Some(ShardId::S1) => match self.storage.open(path) {
                Ok((mut file, size)) => {
                    info!(%path, size, "sending local file");
                    write_size(writer, SizeHeader::Found(size))?;
                    copy_exact(&mut file, size, writer)?;
                }
                Err(err) => {
                    info!(%path, "cannot send local file: {err}");
                    write_size(writer, SizeHeader::NotFound)?;
                }
            },
            Some(shard) => match self.node(shard).map(|node| node.fetch(path)) {
                Some(Ok(Some(stream))) => {
                    info!(%path, %shard, size = stream.size(), "relaying file");
                    write_size(writer, SizeHeader::Found(stream.size()))?;
                    stream.copy_to(writer)?;
                }
                Some(Ok(None)) => {
                    info!(%path, %shard, "file not found");
                    write_size(writer, SizeHeader::NotFound)?;
                }
                Some(Err(err)) => {
                    warn!(%path, %shard, "failed to fetch file: {err}");
                    write_size(writer, SizeHeader::NotFound)?;
                }
                None => {
                    warn!(%path, %shard, "no storage node configured");
                    write_size(writer, SizeHeader::NotFound)?;
                }
            },
            None => {
                warn!(%path, "cannot download unsupported file type");
                write_size(writer, SizeHeader::NotFound)?;
            }
        }
        Ok(writer.flush()?)
    }

    fn download_archive<W: Write>(&self, extension: &str, writer: &mut W) -> ShardResult<()> {
        match shard_for_extension(extension) {
            Some(ShardId::S1) => {
                let archive = build_archive(
                    &self.storage,
                    |name| ShardId::S1.matches_listing(name),
                    self.archiver.as_ref(),
                )
                .and_then(|artifact| Ok((artifact.open()?, artifact)));
                match archive {
                    Ok((mut file, artifact)) => {
                        info!(size = artifact.size(), "sending local archive");
                        write_size(writer, SizeHeader::Found(artifact.size()))?;
                        copy_exact(&mut file, artifact.size(), writer)?;
                    }
                    Err(err) => {
                        error!("failed to build local archive: {err}");
                        write_size(writer, SizeHeader::NotFound)?;
                    }
                }
            }
            Some(shard) if shard.supports_archive() => {
                match self.node(shard).map(NodeClient::create_archive) {
                    Some(Ok(Some(stream))) => {
                        info!(%shard, size = stream.size(), "relaying archive");
                        write_size(writer, SizeHeader::Found(stream.size()))?;
                        stream.copy_to(writer)?;
                    }
                    Some(Ok(None)) => {
                        warn!(%shard, "storage node could not build archive");
                        write_size(writer, SizeHeader::NotFound)?;
                    }
                    Some(Err(err)) => {
                        warn!(%shard, "failed to request archive: {err}");
                        write_size(writer, SizeHeader::NotFound)?;
                    }
                    None => {
                        warn!(%shard, "no storage node configured");
                        write_size(writer, SizeHeader::NotFound)?;
                    }
                }
            }
            _ => {
                warn!(extension, "archive of file type not supported");
                write_size(writer, SizeHeader::NotFound)?;
            }
        }
        Ok(writer.flush()?)
    }

    fn remove(&self, path: &LogicalPath) -> RemoveOutcome {
        let Some(file_name) = path.file_name() else {
            return RemoveOutcome::InvalidPath;
        };
        let Some(shard) = locate(file_name) else {
            warn!(%path, "cannot remove unsupported file type");
            return RemoveOutcome::UnsupportedType;
        };
        if shard.is_local() {
            return match self.storage.delete(path) {
                Ok(DeleteOutcome::Deleted) => {
                    info!(%path, "deleted local file");
                    RemoveOutcome::Deleted(shard)
                }
                Ok(DeleteOutcome::NotFound) => RemoveOutcome::NotFound(shard),
                Err(err) => {
                    error!(%path, "failed to delete local file: {err}");
                    RemoveOutcome::Failed
                }
            };
        }
        match self.node(shard).map(|node| node.delete(path)) {
            Some(Ok(DeleteReply::Deleted)) => {
                info!(%path, %shard, "deleted file");
                RemoveOutcome::Deleted(shard)
            }
            Some(Ok(DeleteReply::NotFound)) => RemoveOutcome::NotFound(shard),
            Some(Ok(DeleteReply::Failed)) => RemoveOutcome::Failed,
            Some(Err(err)) => {
                warn!(%path, %shard, "failed to contact storage node: {err}");
                RemoveOutcome::Unreachable(shard)
            }
            None => RemoveOutcome::Unreachable(shard),
        }
    }
}

impl ConnectionHandler for Coordinator {
    fn handle(&self, stream: TcpStream, peer: SocketAddr) {
        info!(%peer, "client connected");
        let result = stream.try_clone().map_err(ShardError::from).and_then(|write_half| {
            self.serve(&mut FrameReader::new(stream), &mut BufWriter::new(write_half), peer)
        });
        if let Err(err) = result {
            warn!(%peer, "closing client connection: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardfs::archive::TarArchiver;
    use std::fs;
    use std::io::{BufRead, BufReader, Cursor};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};
    use tempfile::{TempDir, tempdir};

    fn coordinator() -> (Coordinator, TempDir) {
        coordinator_with_node(ShardId::S2, unused_addr())
    }

    fn unused_addr() -> SocketAddr {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
    }

    fn coordinator_with_node(node: ShardId, node_addr: SocketAddr) -> (Coordinator, TempDir) {
        let tempdir = tempdir().unwrap();
        let nodes = ShardId::REMOTE
            .into_iter()
            .map(|shard| {
                let addr = if shard == node { node_addr } else { unused_addr() };
                NodeClient::new(shard, addr)
            })
            .collect();
        let coordinator = Coordinator::new(
            FilesystemStorage::new(tempdir.path().to_path_buf()),
            nodes,
            Arc::new(TarArchiver),
        );
        (coordinator, tempdir)
    }

    fn run(coordinator: &Coordinator, input: Vec<u8>) -> Vec<u8> {
        let mut output = Vec::new();
        coordinator
            .serve(
                &mut FrameReader::new(Cursor::new(input)),
                &mut output,
                "127.0.0.1:1234".parse().unwrap(),
            )
            .unwrap();
        output
    }

    /// Answers a single node request with `response` and returns the received command line.
    fn fake_node(response: Vec<u8>) -> (SocketAddr, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut command = String::new();
            BufReader::new(&stream).read_line(&mut command).unwrap();
            stream.write_all(&response).unwrap();
            command
        });
        (addr, handle)
    }

    fn replies(output: &[u8]) -> Vec<String> {
        output
            .split(|&b| b == 0)
            .filter(|reply| !reply.is_empty())
            .map(|reply| String::from_utf8_lossy(reply).into_owned())
            .collect()
    }

    fn upload_input(dest: &str, files: &[(&str, &[u8])]) -> Vec<u8> {
        let names: Vec<_> = files.iter().map(|(name, _)| *name).collect();
        let mut input = format!("uploadf {} {dest}\n", names.join(" ")).into_bytes();
        for (_, content) in files {
            input.extend_from_slice(&(content.len() as i64).to_ne_bytes());
            input.extend_from_slice(content);
        }
        input
    }

    #[test]
    fn test_stores_c_files_locally() {
        let (coordinator, tempdir) = coordinator();
        let output = run(
            &coordinator,
            upload_input("~S1/src", &[("main.c", b"int main() {}"), ("empty.c", b"")]),
        );
        assert_eq!(replies(&output), vec!["Successfully processed 2 out of 2 files"]);
        assert_eq!(
            fs::read(tempdir.path().join("src/main.c")).unwrap(),
            b"int main() {}"
        );
        assert_eq!(fs::read(tempdir.path().join("src/empty.c")).unwrap(), b"");
    }

    #[test]
    fn test_unsupported_type_does_not_desync_connection() {
        let (coordinator, tempdir) = coordinator();
        let mut input = upload_input("~S1", &[("tool.exe", b"MZ\0\n\0"), ("a.c", b"x")]);
        input.extend_from_slice(b"dispfnames ~S1\n");
        let output = run(&coordinator, input);
        assert_eq!(
            replies(&output),
            vec![
                "Successfully processed 1 out of 2 files; tool.exe: unsupported file type",
                "Files found: 1 (.c: 1, .pdf: 0, .txt: 0, .zip: 0)\na.c\n",
            ]
        );
        assert!(!tempdir.path().join("tool.exe").exists());
    }

    #[test]
    fn test_keeps_local_copy_if_node_unreachable() {
        let (coordinator, tempdir) = coordinator();
        let output = run(&coordinator, upload_input("~S1/docs", &[("notes.txt", b"hi")]));
        let reply = &replies(&output)[0];
        assert!(
            reply.starts_with("Successfully processed 0 out of 1 files; notes.txt: failed to forward to S3"),
            "{reply}"
        );
        assert_eq!(fs::read(tempdir.path().join("docs/notes.txt")).unwrap(), b"hi");
    }

    #[test]
    fn test_incomplete_upload_closes_connection_and_leaves_no_file() {
        let (coordinator, tempdir) = coordinator();
        let mut input = upload_input("~S1", &[("a.c", &[b'x'; 100])]);
        input.truncate(input.len() - 1);
        let mut output = Vec::new();
        let result = coordinator.serve(
            &mut FrameReader::new(Cursor::new(input)),
            &mut output,
            "127.0.0.1:1234".parse().unwrap(),
        );
        assert!(matches!(result, Err(ShardError::ShortRead { .. })));
        assert!(output.is_empty());
        assert_eq!(tempdir.path().read_dir().unwrap().count(), 0);
    }

    #[test]
    fn test_rejected_commands_keep_connection_open() {
        let (coordinator, _tempdir) = coordinator();
        let output = run(
            &coordinator,
            b"frobnicate\ndispfnames\ndispfnames /etc\nremovef ~S1/a.c ~S1/b.c ~S1/c.c\n"
                .to_vec(),
        );
        assert_eq!(
            replies(&output),
            vec![
                "Error: Unknown command",
                "Error: Path must be specified",
                "Error: Path must start with ~S1",
                "Error: Invalid command format",
            ]
        );
    }

    #[test]
    fn test_download_sends_sentinel_per_missing_file() {
        let (coordinator, tempdir) = coordinator();
        fs::write(tempdir.path().join("a.c"), "abc").unwrap();
        let output = run(
            &coordinator,
            b"downlf ~S1/missing.c ~S1/a.c\ndownlf ~S1/x.pdf ~S1/y.exe\n".to_vec(),
        );
        let mut expected = (-1i64).to_ne_bytes().to_vec();
        expected.extend_from_slice(&3i64.to_ne_bytes());
        expected.extend_from_slice(b"abc");
        expected.extend_from_slice(&(-1i64).to_ne_bytes());
        expected.extend_from_slice(&(-1i64).to_ne_bytes());
        assert_eq!(output, expected);
    }

    #[test]
    fn test_remove_reports_each_file() {
        let (coordinator, tempdir) = coordinator();
        fs::write(tempdir.path().join("a.c"), "").unwrap();
        let output = run(
            &coordinator,
            b"removef ~S1/a.c ~S1/a.c\nremovef ~S1/b.zip ~S1/c.doc\n".to_vec(),
        );
        assert_eq!(
            replies(&output),
            vec![
                "Remove operation completed. Processed 1 out of 2 files. \
                 Deleted from S1: ~S1/a.c; File not found in S1: ~S1/a.c; ",
                "Remove operation completed. Processed 0 out of 2 files. \
                 Failed to contact S4 for: ~S1/b.zip; Unsupported file type: ~S1/c.doc; ",
            ]
        );
    }

    #[test]
    fn test_archives_local_files() {
        let (coordinator, tempdir) = coordinator();
        fs::create_dir(tempdir.path().join("src")).unwrap();
        fs::write(tempdir.path().join("src/a.c"), "a").unwrap();
        fs::write(tempdir.path().join("notes.txt"), "not archived").unwrap();

        let output = run(&coordinator, b"downltar .c\ndownltar .zip\n".to_vec());
        let size = i64::from_ne_bytes(output[..8].try_into().unwrap()) as usize;
        let mut archive = tar::Archive::new(&output[8..8 + size]);
        let names: Vec<_> = archive
            .entries()
            .unwrap()
            .map(|entry| entry.unwrap().path().unwrap().into_owned())
            .collect();
        assert_eq!(names, vec![std::path::PathBuf::from("src/a.c")]);
        assert_eq!(&output[8 + size..], (-1i64).to_ne_bytes());
        assert_eq!(tempdir.path().read_dir().unwrap().count(), 2);
    }

    #[test]
    fn test_text_reply_in_place_of_size_is_not_relayed() {
        let (addr, node) = fake_node(b"ERROR: File not found in S2\0".to_vec());
        let (coordinator, _tempdir) = coordinator_with_node(ShardId::S2, addr);
        let output = run(&coordinator, b"downlf ~S1/a.pdf ~S1/b.c\n".to_vec());
        assert_eq!(node.join().unwrap(), "GET_FILE ~S2/a.pdf\n");
        assert_eq!(output, [(-1i64).to_ne_bytes(), (-1i64).to_ne_bytes()].concat());
    }

    #[test]
    fn test_relay_broken_after_size_header_closes_connection() {
        let mut response = 100i64.to_ne_bytes().to_vec();
        response.extend_from_slice(&[7; 50]);
        let (addr, node) = fake_node(response.clone());
        let (coordinator, _tempdir) = coordinator_with_node(ShardId::S2, addr);
        let mut output = Vec::new();
        let result = coordinator.serve(
            &mut FrameReader::new(Cursor::new(b"downlf ~S1/a.pdf\ndispfnames ~S1\n".to_vec())),
            &mut output,
            "127.0.0.1:1234".parse().unwrap(),
        );
        node.join().unwrap();
        assert!(
            matches!(result, Err(ShardError::ShortRead { .. })),
            "{result:?}"
        );
        assert!(result.unwrap_err().is_fatal_for_connection());
        assert_eq!(output, response);
    }
}
