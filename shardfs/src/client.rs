//! Blocking clients for the coordinator and the storage nodes.

use crate::command::{
    Command, MAX_DOWNLOAD_FILES, MAX_REMOVE_FILES, MAX_UPLOAD_FILES, NodeCommand, upload_name,
};
use crate::error::{ShardError, ShardResult, WithPath};
use crate::path::{LogicalPath, NAMESPACE_ROOT, validate_file_name};
use crate::placement::ShardId;
use crate::protocol::{FrameReader, SizeHeader, UploadHeader, copy_exact, write_size};
use crate::report::{DeleteReply, NodeListing, StoreReply};
use std::fs::File;
use std::io;
use std::io::{BufWriter, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::path::PathBuf;

/// A file being received: the size header was read, the payload is still pending.
pub struct FileStream<R> {
    reader: FrameReader<R>,
    size: u64,
}

impl<R: Read> FileStream<R> {
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Streams the payload into `writer`.
    pub fn copy_to<W: Write + ?Sized>(mut self, writer: &mut W) -> ShardResult<()> {
        self.reader.copy_exact(self.size, writer)
    }
}

/// Client for a storage node. Every request uses a new connection.
#[derive(Debug, Clone)]
pub struct NodeClient {
    shard: ShardId,
    addr: SocketAddr,
}

impl NodeClient {
    pub fn new(shard: ShardId, addr: SocketAddr) -> Self {
        Self { shard, addr }
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Fetches a file. Returns `None` if the node does not have it.
    pub fn fetch(&self, path: &LogicalPath) -> ShardResult<Option<FileStream<TcpStream>>> {
        self.request_file(&NodeCommand::GetFile(self.node_path(path)))
    }

    /// Requests an archive of all files of the node's type. Returns `None` if the node could
    /// not build it.
    pub fn create_archive(&self) -> ShardResult<Option<FileStream<TcpStream>>> {
        self.request_file(&NodeCommand::CreateTar(self.shard.extension().to_string()))
    }

    pub fn delete(&self, path: &LogicalPath) -> ShardResult<DeleteReply> {
        let reply = self.request_text(&NodeCommand::Delete(self.node_path(path)))?;
        Ok(DeleteReply::parse(&reply))
    }

    pub fn list(&self, path: &LogicalPath) -> ShardResult<NodeListing> {
        let reply = self.request_text(&NodeCommand::List(self.node_path(path)))?;
        Ok(NodeListing::parse(&reply))
    }

    /// Uploads `size` bytes from `payload` as `file_name` into the directory `dest`.
    ///
    /// The write side of the connection is closed after the payload, then the node's
    /// confirmation is awaited.
    pub fn upload<R: Read + ?Sized>(
        &self,
        dest: &LogicalPath,
        file_name: &str,
        size: u64,
        payload: &mut R,
    ) -> ShardResult<StoreReply> {
        let stream = self.connect()?;
        {
            let mut writer = BufWriter::new(&stream);
            UploadHeader {
                dest_path: self.node_path(dest).to_string(),
                file_name: file_name.to_string(),
                file_size: size,
            }
            .encode(&mut writer)?;
            copy_exact(payload, size, &mut writer)?;
            writer.flush()?;
        }
        stream.shutdown(Shutdown::Write)?;
        let reply = FrameReader::new(stream).read_reply()?;
        Ok(StoreReply::parse(&reply))
    }

    fn node_path(&self, path: &LogicalPath) -> LogicalPath {
        path.with_shard(self.shard)
    }

    fn connect(&self) -> ShardResult<TcpStream> {
        TcpStream::connect(self.addr).map_err(|error| ShardError::UnreachablePeer {
            shard: self.shard,
            error,
        })
    }

    fn send_command(&self, command: &NodeCommand) -> ShardResult<TcpStream> {
        let mut stream = self.connect()?;
        stream.write_all(format!("{command}\n").as_bytes())?;
        stream.flush()?;
        Ok(stream)
    }

    fn request_text(&self, command: &NodeCommand) -> ShardResult<String> {
        let stream = self.send_command(command)?;
        FrameReader::new(stream).read_reply()
    }

    fn request_file(&self, command: &NodeCommand) -> ShardResult<Option<FileStream<TcpStream>>> {
        let stream = self.send_command(command)?;
        let mut reader = FrameReader::new(stream);
        match reader.read_size()? {
            SizeHeader::Found(size) => Ok(Some(FileStream { reader, size })),
            SizeHeader::NotFound => Ok(None),
        }
    }
}

/// Client for the coordinator, using one persistent connection for all commands.
///
/// # Examples
///
/// ```no_run
/// use shardfs::client::CoordinatorClient;
/// use shardfs::path::LogicalPath;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut client = CoordinatorClient::connect("127.0.0.1:8000")?;
/// let dest = LogicalPath::parse("~S1/docs")?;
/// println!("{}", client.upload(&["notes.txt".into()], &dest)?);
/// println!("{}", client.list(&dest)?);
/// # Ok(())
/// # }
/// ```
pub struct CoordinatorClient {
    reader: FrameReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl CoordinatorClient {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> ShardResult<Self> {
        let stream = TcpStream::connect(addr).map_err(|error| ShardError::UnreachablePeer {
            shard: NAMESPACE_ROOT,
            error,
        })?;
        Ok(Self {
            reader: FrameReader::new(stream.try_clone()?),
            writer: BufWriter::new(stream),
        })
    }

    /// Uploads local files into the directory `dest` and returns the coordinator's report.
    ///
    /// All files are opened before the command is sent, so a missing local file aborts the
    /// upload without touching the connection.
    pub fn upload(&mut self, files: &[PathBuf], dest: &LogicalPath) -> ShardResult<String> {
        check_count(files.len(), MAX_UPLOAD_FILES)?;
        check_namespace(dest)?;
        let mut sources = Vec::with_capacity(files.len());
        let mut names = Vec::with_capacity(files.len());
        for path in files {
            let name = path.to_string_lossy().into_owned();
            validate_file_name(upload_name(&name))?;
            let file = File::open(path).with_path(path)?;
            let size = file.metadata().with_path(path)?.len();
            sources.push((file, size));
            names.push(name);
        }
        self.send(&Command::Upload {
            files: names,
            dest: dest.clone(),
        })?;
        for (mut file, size) in sources {
            write_size(&mut self.writer, SizeHeader::Found(size))?;
            copy_exact(&mut file, size, &mut self.writer)?;
        }
        self.writer.flush()?;
        self.reader.read_reply()
    }

    /// Downloads files. `open` is called for each file the coordinator returns, to obtain the
    /// writer its payload is streamed into. Returns the size of each file or `None` if it was
    /// not found.
    pub fn download<W, F>(
        &mut self,
        paths: &[LogicalPath],
        mut open: F,
    ) -> ShardResult<Vec<Option<u64>>>
    where
        W: Write,
        F: FnMut(&LogicalPath) -> ShardResult<W>,
    {
        check_count(paths.len(), MAX_DOWNLOAD_FILES)?;
        for path in paths {
            check_namespace(path)?;
        }
        self.send(&Command::Download {
            paths: paths.to_vec(),
        })?;
        let mut sizes = Vec::with_capacity(paths.len());
        for path in paths {
            sizes.push(self.receive_file(|| open(path))?);
        }
        Ok(sizes)
    }

    /// Downloads the archive of all files with the given extension into `writer`.
    pub fn download_archive<W: Write>(
        &mut self,
        extension: &str,
        writer: &mut W,
    ) -> ShardResult<Option<u64>> {
        self.send(&Command::DownloadArchive {
            extension: extension.to_string(),
        })?;
        self.receive_file(move || Ok(writer))
    }

    pub fn remove(&mut self, paths: &[LogicalPath]) -> ShardResult<String> {
        check_count(paths.len(), MAX_REMOVE_FILES)?;
        for path in paths {
            check_namespace(path)?;
        }
        self.send(&Command::Remove {
            paths: paths.to_vec(),
        })?;
        self.reader.read_reply()
    }

    pub fn list(&mut self, path: &LogicalPath) -> ShardResult<String> {
        check_namespace(path)?;
        self.send(&Command::List { path: path.clone() })?;
        self.reader.read_reply()
    }

    /// Sends an arbitrary command line and reads a text reply.
    pub fn send_line(&mut self, line: &str) -> ShardResult<String> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.reader.read_reply()
    }

    fn send(&mut self, command: &Command) -> io::Result<()> {
        self.writer.write_all(format!("{command}\n").as_bytes())?;
        self.writer.flush()
    }

    fn receive_file<W: Write, F: FnOnce() -> ShardResult<W>>(
        &mut self,
        open: F,
    ) -> ShardResult<Option<u64>> {
        let size = match self.reader.read_size()? {
            SizeHeader::Found(size) => size,
            SizeHeader::NotFound => return Ok(None),
        };
        match open() {
            Ok(mut writer) => {
                self.reader.copy_exact(size, &mut writer)?;
                writer.flush()?;
                Ok(Some(size))
            }
            Err(err) => {
                self.reader.copy_exact(size, &mut io::sink())?;
                Err(err)
            }
        }
    }
}

fn check_count(count: usize, max: usize) -> ShardResult<()> {
    if count == 0 || count > max {
        return Err(ShardError::UnsupportedOperation(format!(
            "expected between 1 and {max} files, got {count}"
        )));
    }
    Ok(())
}

fn check_namespace(path: &LogicalPath) -> ShardResult<()> {
    if path.shard() != NAMESPACE_ROOT {
        return Err(ShardError::InvalidPath(path.to_string()));
    }
    Ok(())
}
